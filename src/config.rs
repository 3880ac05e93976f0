//! Configuration module for hop-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::echo::EchoResponse;
use crate::session::SessionOptions;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "hop-relay")]
#[command(author = "hop-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Framed TCP relay, echo endpoint and RTT probe", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Relay exactly one client session to an upstream endpoint
    Relay(RelayArgs),
    /// Run the framed echo endpoint
    Echo(EchoArgs),
    /// Measure round-trip times against an endpoint
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Default)]
pub struct RelayArgs {
    /// Address to listen on for the single client (e.g., 127.0.0.1:1338)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Upstream address to forward to (e.g., 10.0.0.2:1337)
    #[arg(short = 'u', long)]
    pub upstream: Option<String>,

    /// Reject frames declaring more payload bytes than this
    #[arg(long)]
    pub max_frame_len: Option<u32>,

    /// Milliseconds the surviving direction may drain after the other stops
    #[arg(long)]
    pub drain_grace_ms: Option<u64>,
}

#[derive(Args, Debug, Default)]
pub struct EchoArgs {
    /// Address to bind to (e.g., 0.0.0.0:1337)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent clients
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Response mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<EchoModeKind>,

    /// Number of copies of the request returned in `replicate` mode
    #[arg(long)]
    pub replicate: Option<usize>,

    /// File whose contents are returned in `fixed` mode, as raw bytes
    /// (not base32 text)
    #[arg(long)]
    pub fixed_payload: Option<PathBuf>,

    /// Seconds of idleness before keepalive probes start
    #[arg(long)]
    pub keepalive_idle_secs: Option<u64>,

    /// Seconds between keepalive probes
    #[arg(long)]
    pub keepalive_interval_secs: Option<u64>,

    /// Unanswered probes before the connection is dropped
    #[arg(long)]
    pub keepalive_retries: Option<u32>,

    /// Reject frames declaring more payload bytes than this
    #[arg(long)]
    pub max_frame_len: Option<u32>,
}

#[derive(Args, Debug, Default)]
pub struct ProbeArgs {
    /// Address to measure against (relay or echo endpoint)
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Number of samples to record
    #[arg(short = 's', long)]
    pub samples: Option<usize>,

    /// Payload bytes per request
    #[arg(short = 'p', long)]
    pub payload_size: Option<usize>,

    /// Requests sent and discarded before recording
    #[arg(long)]
    pub warmup: Option<usize>,

    /// Milliseconds to sleep between requests
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

/// How the echo endpoint answers each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum EchoModeKind {
    /// Return the request payload unchanged
    #[default]
    Echo,
    /// Return the request payload repeated N times
    Replicate,
    /// Return a fixed payload loaded from a file
    Fixed,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub echo: EchoSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay-related configuration
#[derive(Debug, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_relay_listen")]
    pub listen: String,
    #[serde(default = "default_upstream")]
    pub upstream: String,
    pub max_frame_len: Option<u32>,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: default_relay_listen(),
            upstream: default_upstream(),
            max_frame_len: None,
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

/// Echo endpoint configuration
#[derive(Debug, Deserialize)]
pub struct EchoSection {
    #[serde(default = "default_echo_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub mode: EchoModeKind,
    #[serde(default = "default_replicate")]
    pub replicate: usize,
    pub fixed_payload: Option<PathBuf>,
    #[serde(default = "default_keepalive_idle")]
    pub keepalive_idle_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_retries")]
    pub keepalive_retries: u32,
    pub max_frame_len: Option<u32>,
}

impl Default for EchoSection {
    fn default() -> Self {
        Self {
            listen: default_echo_listen(),
            max_connections: default_max_connections(),
            mode: EchoModeKind::default(),
            replicate: default_replicate(),
            fixed_payload: None,
            keepalive_idle_secs: default_keepalive_idle(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_retries: default_keepalive_retries(),
            max_frame_len: None,
        }
    }
}

/// Probe configuration
#[derive(Debug, Deserialize)]
pub struct ProbeSection {
    #[serde(default = "default_relay_listen")]
    pub target: String,
    #[serde(default = "default_samples")]
    pub samples: usize,
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "default_warmup")]
    pub warmup: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            target: default_relay_listen(),
            samples: default_samples(),
            payload_size: default_payload_size(),
            warmup: default_warmup(),
            interval_ms: default_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_relay_listen() -> String {
    "127.0.0.1:1338".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:1337".to_string()
}

fn default_echo_listen() -> String {
    "0.0.0.0:1337".to_string()
}

fn default_drain_grace_ms() -> u64 {
    250
}

fn default_max_connections() -> usize {
    10000
}

fn default_replicate() -> usize {
    2
}

fn default_keepalive_idle() -> u64 {
    1
}

fn default_keepalive_interval() -> u64 {
    3
}

fn default_keepalive_retries() -> u32 {
    5
}

fn default_samples() -> usize {
    500
}

fn default_payload_size() -> usize {
    512
}

fn default_warmup() -> usize {
    25
}

fn default_interval_ms() -> u64 {
    10 // keep the probe from saturating the link
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: String,
    pub upstream: String,
    pub max_frame_len: Option<u32>,
    pub drain_grace: Duration,
}

impl RelayConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_frame_len: self.max_frame_len,
            drain_grace: self.drain_grace,
        }
    }
}

/// TCP keepalive parameters for accepted echo clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub retries: u32,
}

/// Resolved echo configuration
#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub listen: String,
    pub max_connections: usize,
    pub response: EchoResponse,
    pub keepalive: KeepaliveConfig,
    pub max_frame_len: Option<u32>,
}

/// Resolved probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub target: String,
    pub samples: usize,
    pub payload_size: usize,
    pub warmup: usize,
    pub interval: Duration,
}

/// What the process was asked to run.
#[derive(Debug, Clone)]
pub enum Mode {
    Relay(RelayConfig),
    Echo(EchoConfig),
    Probe(ProbeConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        let mode = match cli.command {
            Command::Relay(args) => Mode::Relay(resolve_relay(args, toml_config.relay)),
            Command::Echo(args) => Mode::Echo(resolve_echo(args, toml_config.echo)?),
            Command::Probe(args) => Mode::Probe(resolve_probe(args, toml_config.probe)?),
        };

        Ok(Config {
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            mode,
        })
    }
}

fn resolve_relay(args: RelayArgs, file: RelaySection) -> RelayConfig {
    RelayConfig {
        listen: args.listen.unwrap_or(file.listen),
        upstream: args.upstream.unwrap_or(file.upstream),
        max_frame_len: args.max_frame_len.or(file.max_frame_len),
        drain_grace: Duration::from_millis(args.drain_grace_ms.unwrap_or(file.drain_grace_ms)),
    }
}

fn resolve_echo(args: EchoArgs, file: EchoSection) -> Result<EchoConfig, ConfigError> {
    let response = match args.mode.unwrap_or(file.mode) {
        EchoModeKind::Echo => EchoResponse::Echo,
        EchoModeKind::Replicate => {
            let copies = args.replicate.unwrap_or(file.replicate);
            if copies == 0 {
                return Err(ConfigError::Invalid(
                    "replicate count must be at least 1".to_string(),
                ));
            }
            EchoResponse::Replicate(copies)
        }
        EchoModeKind::Fixed => {
            let path = args.fixed_payload.or(file.fixed_payload).ok_or_else(|| {
                ConfigError::Invalid("fixed mode requires a fixed_payload file".to_string())
            })?;
            let payload =
                std::fs::read(&path).map_err(|source| ConfigError::FileRead {
                    path: path.clone(),
                    source,
                })?;
            EchoResponse::Fixed(Bytes::from(payload))
        }
    };

    let max_connections = args.max_connections.unwrap_or(file.max_connections);
    if max_connections == 0 {
        return Err(ConfigError::Invalid(
            "max_connections must be at least 1".to_string(),
        ));
    }

    Ok(EchoConfig {
        listen: args.listen.unwrap_or(file.listen),
        max_connections,
        response,
        keepalive: KeepaliveConfig {
            idle: Duration::from_secs(args.keepalive_idle_secs.unwrap_or(file.keepalive_idle_secs)),
            interval: Duration::from_secs(
                args.keepalive_interval_secs
                    .unwrap_or(file.keepalive_interval_secs),
            ),
            retries: args.keepalive_retries.unwrap_or(file.keepalive_retries),
        },
        max_frame_len: args.max_frame_len.or(file.max_frame_len),
    })
}

fn resolve_probe(args: ProbeArgs, file: ProbeSection) -> Result<ProbeConfig, ConfigError> {
    let samples = args.samples.unwrap_or(file.samples);
    if samples == 0 {
        return Err(ConfigError::Invalid("samples must be at least 1".to_string()));
    }
    Ok(ProbeConfig {
        target: args.target.unwrap_or(file.target),
        samples,
        payload_size: args.payload_size.unwrap_or(file.payload_size),
        warmup: args.warmup.unwrap_or(file.warmup),
        interval: Duration::from_millis(args.interval_ms.unwrap_or(file.interval_ms)),
    })
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("hop-relay-{}-{name}", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.relay.listen, "127.0.0.1:1338");
        assert_eq!(config.relay.upstream, "127.0.0.1:1337");
        assert_eq!(config.relay.max_frame_len, None);
        assert_eq!(config.echo.keepalive_idle_secs, 1);
        assert_eq!(config.echo.keepalive_interval_secs, 3);
        assert_eq!(config.echo.keepalive_retries, 5);
        assert_eq!(config.probe.warmup, 25);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [relay]
            listen = "0.0.0.0:9000"
            upstream = "10.0.0.2:1337"
            max_frame_len = 1048576
            drain_grace_ms = 50

            [echo]
            mode = "replicate"
            replicate = 3
            keepalive_retries = 2

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.relay.listen, "0.0.0.0:9000");
        assert_eq!(config.relay.upstream, "10.0.0.2:1337");
        assert_eq!(config.relay.max_frame_len, Some(1048576));
        assert_eq!(config.relay.drain_grace_ms, 50);
        assert_eq!(config.echo.mode, EchoModeKind::Replicate);
        assert_eq!(config.echo.replicate, 3);
        assert_eq!(config.echo.keepalive_retries, 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_relay_cli_overrides_file() {
        let path = temp_file(
            "relay.toml",
            b"[relay]\nlisten = \"0.0.0.0:9000\"\nupstream = \"10.0.0.2:1337\"\n[logging]\nlevel = \"warn\"\n",
        );
        let cli = parse(&[
            "hop-relay",
            "--config",
            path.to_str().unwrap(),
            "relay",
            "--upstream",
            "127.0.0.1:5000",
        ]);

        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.log_level, "warn");
        match config.mode {
            Mode::Relay(relay) => {
                assert_eq!(relay.listen, "0.0.0.0:9000");
                assert_eq!(relay.upstream, "127.0.0.1:5000");
                assert_eq!(relay.drain_grace, Duration::from_millis(250));
                assert_eq!(relay.session_options().max_frame_len, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_echo_fixed_payload() {
        let path = temp_file("payload.bin", b"\xff\xd8image");
        let cli = parse(&[
            "hop-relay",
            "echo",
            "--mode",
            "fixed",
            "--fixed-payload",
            path.to_str().unwrap(),
        ]);

        match Config::resolve(cli).unwrap().mode {
            Mode::Echo(echo) => {
                assert_eq!(echo.response, EchoResponse::Fixed(Bytes::from_static(b"\xff\xd8image")));
                assert_eq!(echo.keepalive.retries, 5);
            }
            other => panic!("unexpected: {:?}", other),
        }
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_echo_fixed_without_payload_is_invalid() {
        let cli = parse(&["hop-relay", "echo", "--mode", "fixed"]);
        assert!(matches!(Config::resolve(cli), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_probe_rejects_zero_samples() {
        let cli = parse(&["hop-relay", "probe", "--samples", "0"]);
        assert!(matches!(Config::resolve(cli), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = parse(&["hop-relay", "--config", "/nonexistent/hop-relay.toml", "relay"]);
        assert!(matches!(Config::resolve(cli), Err(ConfigError::FileRead { .. })));
    }
}
