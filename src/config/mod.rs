//! Configuration Module
//!
//! Provides TOML-based configuration for RelayMQ with support for:
//! - Source and destination broker sessions (address, credentials, client id)
//! - Forwarding policy (topic filter, subscribe QoS, QoS ceiling, retain)
//! - Audit log settings
//! - Health/metrics endpoint
//! - Environment variable overrides (RELAYMQ__* prefix)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config or credential file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Source broker session (subscribed side)
    pub source: SessionConfig,
    /// Destination broker session (published side)
    pub destination: SessionConfig,
    /// Forwarding policy
    pub forward: ForwardConfig,
    /// Audit log settings
    pub audit: AuditConfig,
    /// Health/metrics endpoint
    pub health: HealthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration for one broker session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Broker address (host:port or just host)
    #[serde(default = "default_address")]
    pub address: String,

    /// Client identifier prefix; a random alphanumeric suffix is appended
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Length of the random client identifier suffix
    #[serde(default = "default_suffix_len")]
    pub client_id_suffix_len: usize,

    /// Use a clean session (no broker-side subscription state)
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Reconnect backoff floor in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,

    /// Reconnect backoff ceiling in seconds (exponential backoff)
    #[serde(default = "default_max_reconnect_interval")]
    pub max_reconnect_interval: u64,

    /// Path to a file containing the username (both-or-neither with password_file)
    pub username_file: Option<PathBuf>,

    /// Path to a file containing the password
    pub password_file: Option<PathBuf>,
}

fn default_address() -> String {
    "localhost:1883".to_string()
}

fn default_client_id_prefix() -> String {
    "relaymq".to_string()
}

fn default_suffix_len() -> usize {
    8
}

fn default_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_max_reconnect_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            client_id_prefix: default_client_id_prefix(),
            client_id_suffix_len: default_suffix_len(),
            clean_session: true,
            keepalive: default_keepalive(),
            connect_timeout: default_connect_timeout(),
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            username_file: None,
            password_file: None,
        }
    }
}

/// Default MQTT port when the address omits one
const DEFAULT_MQTT_PORT: u16 = 1883;

impl SessionConfig {
    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), DEFAULT_MQTT_PORT)
    }

    /// Generate a client identifier: prefix plus a random alphanumeric suffix
    pub fn client_id(&self) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.client_id_suffix_len)
            .map(char::from)
            .collect();
        format!("{}-{}", self.client_id_prefix, suffix)
    }

    /// Read the credential pair from the configured files, if any.
    /// File contents are trimmed of surrounding whitespace.
    pub fn credentials(&self) -> Result<Option<(String, String)>, std::io::Error> {
        match (&self.username_file, &self.password_file) {
            (Some(user_path), Some(pass_path)) => {
                let username = std::fs::read_to_string(user_path)?.trim().to_string();
                let password = std::fs::read_to_string(pass_path)?.trim().to_string();
                Ok(Some((username, password)))
            }
            // One-without-the-other is rejected by validate()
            _ => Ok(None),
        }
    }

    /// Get the keep-alive interval as Duration
    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    /// Get the connect timeout as Duration
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the reconnect backoff floor as Duration
    pub fn reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval)
    }

    /// Get the reconnect backoff ceiling as Duration
    pub fn max_reconnect_interval_duration(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_interval)
    }
}

/// Forwarding policy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Topic filter to subscribe on the source session
    #[serde(default = "default_topic_filter")]
    pub topic_filter: String,

    /// QoS level for the source subscription (0, 1, or 2)
    #[serde(default = "default_subscribe_qos")]
    pub subscribe_qos: u8,

    /// Outbound QoS ceiling: forwarded QoS = min(incoming, qos_max)
    #[serde(default = "default_qos_max")]
    pub qos_max: u8,

    /// Whether to forward the retained flag; false suppresses it outright
    #[serde(default = "default_true")]
    pub forward_retain: bool,
}

fn default_topic_filter() -> String {
    "#".to_string()
}

fn default_subscribe_qos() -> u8 {
    1
}

fn default_qos_max() -> u8 {
    1
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            topic_filter: default_topic_filter(),
            subscribe_qos: default_subscribe_qos(),
            qos_max: default_qos_max(),
            forward_retain: true,
        }
    }
}

/// Audit log configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Whether audit logging is enabled
    pub enabled: bool,

    /// Path of the newline-delimited JSON audit file
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("relay-audit.ndjson")
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_audit_path(),
        }
    }
}

/// Health/metrics endpoint configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Whether the HTTP endpoint is served
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address for the endpoint
    #[serde(default = "default_health_bind")]
    pub bind: SocketAddr,
}

fn default_health_bind() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_health_bind(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `RELAYMQ__` prefix with double underscores for nesting:
    ///    - `RELAYMQ__SOURCE__ADDRESS=broker-a:1883` overrides `source.address`
    ///    - `RELAYMQ__FORWARD__QOS_MAX=0` overrides `forward.qos_max`
    ///    - `RELAYMQ__AUDIT__ENABLED=true` overrides `audit.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("source.address", "localhost:1883")?
            .set_default("source.client_id_prefix", "relaymq")?
            .set_default("source.client_id_suffix_len", 8)?
            .set_default("source.clean_session", true)?
            .set_default("source.keepalive", 60)?
            .set_default("source.connect_timeout", 30)?
            .set_default("source.reconnect_interval", 5)?
            .set_default("source.max_reconnect_interval", 60)?
            .set_default("destination.address", "localhost:1883")?
            .set_default("destination.client_id_prefix", "relaymq")?
            .set_default("destination.client_id_suffix_len", 8)?
            .set_default("destination.clean_session", true)?
            .set_default("destination.keepalive", 60)?
            .set_default("destination.connect_timeout", 30)?
            .set_default("destination.reconnect_interval", 5)?
            .set_default("destination.max_reconnect_interval", 60)?
            .set_default("forward.topic_filter", "#")?
            .set_default("forward.subscribe_qos", 1)?
            .set_default("forward.qos_max", 1)?
            .set_default("forward.forward_retain", true)?
            .set_default("audit.enabled", false)?
            .set_default("audit.path", "relay-audit.ndjson")?
            .set_default("health.enabled", true)?
            .set_default("health.bind", "0.0.0.0:9090")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (RELAYMQ__SOURCE__ADDRESS, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("RELAYMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forward.qos_max > 2 {
            return Err(ConfigError::Validation(
                "forward.qos_max must be 0, 1, or 2".to_string(),
            ));
        }
        if self.forward.subscribe_qos > 2 {
            return Err(ConfigError::Validation(
                "forward.subscribe_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.forward.topic_filter.is_empty() {
            return Err(ConfigError::Validation(
                "forward.topic_filter must not be empty".to_string(),
            ));
        }

        for (name, session) in [("source", &self.source), ("destination", &self.destination)] {
            if session.address.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{}.address must not be empty",
                    name
                )));
            }
            if session.client_id_suffix_len == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.client_id_suffix_len must be at least 1",
                    name
                )));
            }
            match (&session.username_file, &session.password_file) {
                (Some(_), None) | (None, Some(_)) => {
                    return Err(ConfigError::Validation(format!(
                        "{} credentials require both username_file and password_file",
                        name
                    )));
                }
                _ => {}
            }
        }

        if self.audit.enabled && self.audit.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "audit.path is required when audit.enabled is true".to_string(),
            ));
        }

        Ok(())
    }
}
