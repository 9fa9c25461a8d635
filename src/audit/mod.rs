//! Audit Sink
//!
//! Append-only, newline-delimited JSON log of forwarded messages. Each
//! record captures the inbound message's metadata together with a
//! crash-safe text encoding of its payload: valid UTF-8 payloads are stored
//! as text, everything else as base64, so any record can be decoded back to
//! the exact original bytes.
//!
//! The sink is best-effort. A failed write loses that single record and
//! nothing else; once the sink is closed, further records are silently
//! dropped rather than queued.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::Inbound;

/// Audit error types
#[derive(Debug)]
pub enum AuditError {
    /// IO error opening or writing the audit file
    Io(std::io::Error),
    /// Record could not be serialized
    Serialize(serde_json::Error),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Io(e) => write!(f, "IO error: {}", e),
            AuditError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Io(e)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Serialize(e)
    }
}

/// How a record's payload field is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Payload bytes were valid UTF-8 and are stored as text
    Utf8,
    /// Payload bytes are stored base64-encoded (standard alphabet)
    Base64,
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Event timestamp, ISO-8601 UTC with millisecond precision
    pub time: String,
    /// Topic the message arrived on
    pub topic: String,
    /// QoS the message was delivered with
    pub incoming_qos: u8,
    /// Retained flag as delivered
    pub incoming_retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Encoding of the payload field
    pub payload_encoding: PayloadEncoding,
    /// Payload, encoded per `payload_encoding`
    pub payload: String,
}

impl AuditRecord {
    /// Build a record from an inbound message.
    ///
    /// Payloads that decode as UTF-8 are stored as text; a successful
    /// `str::from_utf8` is byte-for-byte reversible, so re-encoding the
    /// text always reproduces the original bytes. Anything else falls back
    /// to base64.
    pub fn from_message(time: DateTime<Utc>, message: &Inbound) -> Self {
        let (payload_encoding, payload) = match std::str::from_utf8(&message.payload) {
            Ok(text) => (PayloadEncoding::Utf8, text.to_string()),
            Err(_) => (PayloadEncoding::Base64, BASE64.encode(&message.payload)),
        };

        Self {
            time: time.to_rfc3339_opts(SecondsFormat::Millis, true),
            topic: message.topic.clone(),
            incoming_qos: message.qos,
            incoming_retain: message.retain,
            dup: message.dup,
            payload_encoding,
            payload,
        }
    }

    /// Reconstruct the original payload bytes
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => BASE64.decode(&self.payload),
        }
    }
}

enum WriterState {
    /// First record not yet written
    Unopened,
    /// Open append handle, reused for the process lifetime
    Open(BufWriter<File>),
    /// Flushed and closed, or the stream errored; writes are dropped
    Closed,
}

/// Append-only NDJSON writer
///
/// Writes are serialized by a mutex so concurrent callers cannot interleave
/// partial lines. The file is opened for append exactly once, lazily on the
/// first record; missing parent directories are created at that point.
pub struct AuditSink {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

impl AuditSink {
    /// Create a sink for the given path. The file is not touched until the
    /// first record arrives.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(WriterState::Unopened),
        }
    }

    /// Path of the audit file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line. Returns whether the record
    /// reached the file.
    ///
    /// After the sink is closed, records are silently dropped (`Ok(false)`).
    /// A failure to open the file, or an IO error writing or flushing a
    /// line, closes the sink permanently: a record reported lost must stay
    /// lost, and leaving the writer open would let its buffered bytes reach
    /// the file on a later flush.
    pub fn record(&self, record: &AuditRecord) -> Result<bool, AuditError> {
        let mut guard = self.writer.lock();

        if matches!(*guard, WriterState::Unopened) {
            match self.open() {
                Ok(writer) => *guard = WriterState::Open(writer),
                Err(e) => {
                    *guard = WriterState::Closed;
                    return Err(e);
                }
            }
        }

        let WriterState::Open(writer) = &mut *guard else {
            return Ok(false);
        };

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).and_then(|_| writer.flush()) {
            *guard = WriterState::Closed;
            return Err(AuditError::Io(e));
        }
        Ok(true)
    }

    fn open(&self) -> Result<BufWriter<File>, AuditError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        debug!(path = %self.path.display(), "audit log opened");
        Ok(BufWriter::new(file))
    }

    /// Flush and close the sink. Idempotent; later records are dropped.
    pub fn close(&self) {
        let mut guard = self.writer.lock();
        if let WriterState::Open(writer) = &mut *guard {
            let _ = writer.flush();
        }
        *guard = WriterState::Closed;
    }
}
