//! RelayMQ - MQTT message relay between two brokers
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Configuration file path
//!   --source-address <ADDR>     Source broker address (host:port)
//!   --destination-address <ADDR> Destination broker address (host:port)
//!   -t, --topic-filter <FILTER> Topic filter to relay
//!   --audit-file <FILE>         Enable the audit log at this path
//!   --health-bind <ADDR>        Health/metrics bind address
//!   -l, --log-level             Log level (error, warn, info, debug, trace)
//!   -h, --help                  Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::config::Config;
use relaymq::{
    AuditSink, HealthServer, Metrics, MqttSession, ReadyFlag, Relay, Session, SessionEvent,
};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// RelayMQ - MQTT message relay
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version = "0.1.0")]
#[command(about = "Relay MQTT messages from one broker to another")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source broker address (host:port)
    #[arg(long)]
    source_address: Option<String>,

    /// Destination broker address (host:port)
    #[arg(long)]
    destination_address: Option<String>,

    /// Topic filter to subscribe on the source broker
    #[arg(short, long)]
    topic_filter: Option<String>,

    /// Write an NDJSON audit record for every relayed message to this file
    #[arg(long)]
    audit_file: Option<PathBuf>,

    /// Health/metrics endpoint bind address
    #[arg(long)]
    health_bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise env vars over defaults
    let mut config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                std::process::exit(1);
            }
        },
    };

    // CLI args override file config
    if let Some(addr) = args.source_address {
        config.source.address = addr;
    }
    if let Some(addr) = args.destination_address {
        config.destination.address = addr;
    }
    if let Some(filter) = args.topic_filter {
        config.forward.topic_filter = filter;
    }
    if let Some(path) = args.audit_file {
        config.audit.enabled = true;
        config.audit.path = path;
    }
    if let Some(bind) = args.health_bind {
        config.health.bind = bind;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting RelayMQ");
    info!("  Source: {}", config.source.address);
    info!("  Destination: {}", config.destination.address);
    info!(
        "  Forward: {} (subscribe_qos={}, qos_max={}, forward_retain={})",
        config.forward.topic_filter,
        config.forward.subscribe_qos,
        config.forward.qos_max,
        config.forward.forward_retain
    );
    if config.audit.enabled {
        info!("  Audit log: {}", config.audit.path.display());
    } else {
        info!("  Audit log: disabled");
    }

    let metrics = Arc::new(Metrics::new());
    let ready = ReadyFlag::new();

    // Spawn health/metrics server
    if config.health.enabled {
        info!("  Health endpoint: http://{}", config.health.bind);
        let health_server = HealthServer::new(metrics.clone(), ready.clone(), config.health.bind);
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                error!("Health server error: {}", e);
            }
        });
    } else {
        info!("  Health endpoint: disabled");
    }

    // Connect both sessions before subscribing; a broker that is down or
    // rejects the connection aborts startup.
    let (source, source_events) = match MqttSession::connect("source", &config.source).await {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Failed to connect source session: {}", e);
            std::process::exit(1);
        }
    };
    metrics.set_source_connected(true);

    let (destination, destination_events) =
        match MqttSession::connect("destination", &config.destination).await {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("Failed to connect destination session: {}", e);
                let _ = source.end().await;
                std::process::exit(1);
            }
        };
    metrics.set_destination_connected(true);

    // Drain destination lifecycle events; the relay only consumes the
    // source stream.
    {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut events = destination_events;
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Connected { .. } => {
                        metrics.set_destination_connected(true);
                        info!("destination session reconnected");
                    }
                    SessionEvent::Disconnected(reason) => {
                        metrics.set_destination_connected(false);
                        warn!(reason = %reason, "destination session disconnected");
                    }
                    SessionEvent::Message(_) => {}
                }
            }
        });
    }

    let audit = if config.audit.enabled {
        Some(Arc::new(AuditSink::new(&config.audit.path)))
    } else {
        None
    };

    let source: Arc<dyn Session> = Arc::new(source);
    let destination: Arc<dyn Session> = Arc::new(destination);
    let mut relay = Relay::new(
        &config.forward,
        source,
        destination,
        source_events,
        audit,
        metrics.clone(),
    );

    if let Err(e) = relay.start().await {
        error!("Failed to start relay: {}", e);
        relay.shutdown().await;
        std::process::exit(1);
    }
    ready.set(true);

    // Ctrl+C triggers graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = relay.run(shutdown_rx).await;

    // Stop advertising readiness before tearing anything down
    ready.set(false);
    relay.shutdown().await;

    match result {
        Ok(()) => {
            info!("RelayMQ stopped");
            Ok(())
        }
        Err(e) => {
            error!("Relay terminated: {}", e);
            std::process::exit(1);
        }
    }
}
