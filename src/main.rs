//! Redstream - at-least-once event delivery over Redis-compatible streams
//!
//! Operational entry point: run a consumer, publish an event, trim a
//! stream, inspect the pending entries list or check a configuration.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use redstream::config::{Config, LogFormat};
use redstream::{LogHandler, StreamClient, StreamError};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit code for connectivity failures.
const EXIT_CONNECTION: u8 = 2;

/// Exit code for any other stream failure.
const EXIT_STREAM: u8 = 1;

/// Exit code for failures outside the stream protocol.
const EXIT_UNEXPECTED: u8 = 3;

/// Redstream - at-least-once event delivery over Redis-compatible streams
#[derive(Parser, Debug)]
#[command(name = "redstream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Stream name (overrides config file)
    #[arg(
        short = 's',
        long = "stream",
        value_name = "NAME",
        env = "REDSTREAM_STREAM",
        global = true
    )]
    stream: Option<String>,

    /// Consumer group (overrides config file)
    #[arg(
        short = 'g',
        long = "group",
        value_name = "NAME",
        env = "REDSTREAM_GROUP",
        global = true
    )]
    group: Option<String>,

    /// Consumer name within the group (overrides config file)
    #[arg(
        long = "consumer",
        value_name = "NAME",
        env = "REDSTREAM_CONSUMER",
        global = true
    )]
    consumer: Option<String>,

    /// Poll interval in seconds (overrides config file)
    #[arg(
        short = 'i',
        long = "interval",
        value_name = "SECONDS",
        env = "REDSTREAM_INTERVAL",
        global = true
    )]
    interval: Option<f64>,

    /// Entries read per cycle (overrides config file)
    #[arg(
        short = 'b',
        long = "batch",
        value_name = "NUM",
        env = "REDSTREAM_BATCH",
        global = true
    )]
    batch: Option<usize>,

    /// Deliveries before an entry is discarded (overrides config file)
    #[arg(
        short = 'r',
        long = "retries",
        value_name = "NUM",
        env = "REDSTREAM_RETRIES",
        global = true
    )]
    retries: Option<u64>,

    /// Backend driver: native or library (overrides config file)
    #[arg(
        long = "driver",
        value_name = "DRIVER",
        env = "REDSTREAM_DRIVER",
        global = true
    )]
    driver: Option<String>,

    /// Server host (overrides config file)
    #[arg(long = "host", value_name = "HOST", env = "REDSTREAM_HOST", global = true)]
    host: Option<String>,

    /// Server port (overrides config file)
    #[arg(
        short = 'p',
        long = "port",
        value_name = "PORT",
        env = "REDSTREAM_PORT",
        global = true
    )]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error (overrides config file)
    #[arg(
        short = 'l',
        long = "log-level",
        alias = "loglevel",
        value_name = "LEVEL",
        env = "REDSTREAM_LOG_LEVEL",
        global = true
    )]
    loglevel: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Join the consumer group and log every event until interrupted
    Consume,

    /// Publish one event to the stream
    Publish {
        /// Event tag
        event: String,

        /// Event payload as JSON
        payload: String,

        /// Extra metadata merged into the envelope (can be specified multiple times)
        #[arg(long = "meta", value_name = "KEY=VALUE", action = ArgAction::Append)]
        meta: Vec<String>,
    },

    /// Trim the stream to a maximum length
    Trim {
        /// Entries to keep
        #[arg(allow_negative_numbers = true)]
        max_len: i64,

        /// Trim exactly instead of approximately
        #[arg(long = "exact", action = ArgAction::SetTrue)]
        exact: bool,
    },

    /// Print the consumer group's pending entries
    Pending {
        /// Maximum number of entries to list
        #[arg(long = "count", default_value_t = 10)]
        count: usize,

        /// Only list entries owned by this consumer
        #[arg(long = "owner", value_name = "NAME")]
        owner: Option<String>,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

impl Cli {
    /// Apply CLI overrides to a configuration
    fn apply_to_config(&self, config: &mut Config) -> Result<(), String> {
        if let Some(ref stream) = self.stream {
            config.streams.stream = stream.clone();
        }
        if let Some(ref group) = self.group {
            config.streams.consumer_group = group.clone();
        }
        if let Some(ref consumer) = self.consumer {
            config.streams.consumer_name = consumer.clone();
        }
        if let Some(interval) = self.interval {
            config.streams.poll_interval = interval;
        }
        if let Some(batch) = self.batch {
            config.streams.batch_size = batch;
        }
        if let Some(retries) = self.retries {
            config.streams.retry_limit = retries;
        }
        if let Some(ref level) = self.loglevel {
            config.logging.level = level.clone();
        }

        if self.driver.is_some() || self.host.is_some() || self.port.is_some() {
            let name = config.streams.connection.clone();
            let connection = config.connections.get_mut(&name).ok_or_else(|| {
                format!("connection '{}' is not defined under [connections]", name)
            })?;
            if let Some(ref driver) = self.driver {
                connection.driver = driver.clone();
            }
            if let Some(ref host) = self.host {
                connection.host = host.clone();
            }
            if let Some(port) = self.port {
                connection.port = port;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ConfigSource {
    Explicit(PathBuf),
    DefaultFile(PathBuf),
    Defaults,
}

impl ConfigSource {
    fn label(&self) -> String {
        match self {
            ConfigSource::Explicit(path) | ConfigSource::DefaultFile(path) => {
                path.display().to_string()
            }
            ConfigSource::Defaults => "built-in defaults".to_string(),
        }
    }
}

fn load_config(cli: &Cli) -> Result<(Config, ConfigSource), StreamError> {
    if let Some(path) = &cli.config {
        if !path.exists() {
            return Err(StreamError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        let config = Config::from_file(path)?;
        return Ok((config, ConfigSource::Explicit(path.clone())));
    }

    let default_path = PathBuf::from("redstream.toml");
    if default_path.exists() {
        let config = Config::from_file(&default_path)?;
        return Ok((config, ConfigSource::DefaultFile(default_path)));
    }

    Ok((Config::default(), ConfigSource::Defaults))
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
}

fn exit_status(err: &StreamError) -> u8 {
    match err {
        StreamError::Connection { .. } => EXIT_CONNECTION,
        StreamError::Serialization(_) => EXIT_UNEXPECTED,
        _ => EXIT_STREAM,
    }
}

fn exit_code(err: &StreamError) -> ExitCode {
    ExitCode::from(exit_status(err))
}

/// Parse `--meta key=value` pairs. Values that parse as JSON keep their
/// type; anything else is stored as a string.
fn parse_meta(pairs: &[String]) -> Result<Map<String, Value>, StreamError> {
    let mut extra = Map::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            StreamError::InvalidArgument(format!(
                "invalid metadata '{}': expected key=value format",
                pair
            ))
        })?;
        if key.is_empty() {
            return Err(StreamError::InvalidArgument(format!(
                "invalid metadata '{}': empty key",
                pair
            )));
        }
        let value =
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        extra.insert(key.to_string(), value);
    }
    Ok(extra)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    shutdown_on(tokio::signal::ctrl_c())
}

/// Cancel the returned token when `signal` fires. If the listener cannot
/// be installed the token is never cancelled.
fn shutdown_on<F>(signal: F) -> CancellationToken
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("interrupt received; stopping after the current cycle");
                trigger.cancel();
            }
            Err(e) => {
                error!(error = %e, "failed to listen for interrupts; consumer will run until terminated");
            }
        }
    });
    token
}

async fn cmd_consume(client: &StreamClient) -> Result<(), StreamError> {
    let consumer = client.consumer();
    consumer.consume(&LogHandler, shutdown_on_ctrl_c()).await
}

async fn cmd_publish(
    client: &StreamClient,
    event: &str,
    payload: &str,
    meta: &[String],
) -> Result<(), StreamError> {
    let payload: Value = serde_json::from_str(payload)?;
    let extra = parse_meta(meta)?;
    let producer = client.producer();
    let id = producer.publish(event, &payload, extra).await?;
    println!("{}", id);
    Ok(())
}

async fn cmd_trim(client: &StreamClient, max_len: i64, exact: bool) -> Result<(), StreamError> {
    let producer = client.producer();
    let removed = producer.trim(max_len, exact).await?;
    println!("Trimmed {} entries from {}", removed, producer.stream());
    Ok(())
}

async fn cmd_pending(
    client: &StreamClient,
    count: usize,
    owner: Option<&str>,
) -> Result<(), StreamError> {
    let consumer = client.consumer();
    let entries = consumer.pending(count, owner).await?;
    if entries.is_empty() {
        println!("No pending entries");
        return Ok(());
    }

    println!(
        "{:<24} {:<24} {:>12} {:>10}",
        "ID", "CONSUMER", "IDLE", "DELIVERIES"
    );
    for entry in entries {
        println!(
            "{:<24} {:<24} {:>12?} {:>10}",
            entry.id.to_string(),
            entry.consumer,
            Duration::from_millis(entry.idle_ms),
            entry.delivery_count
        );
    }
    Ok(())
}

fn cmd_check_config(config: &Config, source: &ConfigSource) -> Result<(), StreamError> {
    let connection = config.connection()?;
    println!("Configuration OK ({})", source.label());
    println!("  Stream: {}", config.streams.stream);
    println!("  Group: {}", config.streams.consumer_group);
    println!("  Consumer: {}", config.streams.consumer_name);
    println!(
        "  Backend: {} at {}",
        connection.backend_kind()?,
        connection.address()
    );
    for (name, stream) in config.streams.custom_streams() {
        println!("  Custom stream {}: {}", name, stream);
    }
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run(cli: Cli) -> ExitCode {
    let (mut config, source) = match load_config(&cli) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_code(&e);
        }
    };

    if let Err(e) = cli.apply_to_config(&mut config) {
        eprintln!("Error: invalid CLI override: {}", e);
        return ExitCode::from(EXIT_STREAM);
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return exit_code(&e);
    }

    if let Commands::CheckConfig = cli.command {
        return match cmd_check_config(&config, &source) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_code(&e)
            }
        };
    }

    init_logging(&config);
    info!(config = %source.label(), "loaded configuration");

    let client = match StreamClient::connect(config).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "failed to connect to stream backend");
            return exit_code(&e);
        }
    };

    let result = match &cli.command {
        Commands::Consume => cmd_consume(&client).await,
        Commands::Publish {
            event,
            payload,
            meta,
        } => cmd_publish(&client, event, payload, meta).await,
        Commands::Trim { max_len, exact } => cmd_trim(&client, *max_len, *exact).await,
        Commands::Pending { count, owner } => cmd_pending(&client, *count, owner.as_deref()).await,
        Commands::CheckConfig => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            exit_code(&e)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments using clap (handles --help and --version automatically)
    let cli = Cli::parse();

    // A panic anywhere in the command surfaces as a join error.
    match tokio::spawn(run(cli)).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: unexpected failure: {}", e);
            ExitCode::from(EXIT_UNEXPECTED)
        }
    }
}
