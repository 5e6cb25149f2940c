//! Configuration module for h2c-speed.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::Protocol;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Byte count downloaded by each predefined test (10 GB).
pub const DEFAULT_TEST_SIZE: u64 = 10_000_000_000;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "h2c-speed")]
#[command(author = "h2c-speed authors")]
#[command(version = "0.1.0")]
#[command(about = "Compare HTTP/1.1 and cleartext HTTP/2 transfer speed", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server mode only: serve until interrupted
    #[arg(short, long, conflicts_with = "url")]
    pub server: bool,

    /// Client mode only: download this URL (e.g. http://localhost:9876/1000000)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Use prior-knowledge HTTP/2 (h2c) for --url
    #[arg(long)]
    pub h2c: bool,

    /// Bytes downloaded by each predefined test
    #[arg(short = 'n', long)]
    pub size: Option<u64>,

    /// Skip the predefined HTTP/1.1 test
    #[arg(long)]
    pub no_http1: bool,

    /// Skip the predefined h2c test
    #[arg(long)]
    pub no_h2c: bool,

    /// Address the servers bind to (default: all interfaces)
    #[arg(long)]
    pub host: Option<String>,

    /// Port of the HTTP/1.1 server
    #[arg(long)]
    pub http1_port: Option<u16>,

    /// Port of the h2c server
    #[arg(long)]
    pub h2c_port: Option<u16>,

    /// Seed of the random payload (defaults to the current time)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http1_port")]
    pub http1_port: u16,
    #[serde(default = "default_h2c_port")]
    pub h2c_port: u16,
    pub seed: Option<u64>,
    /// Serve until interrupted, without running tests
    #[serde(default)]
    pub only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http1_port: default_http1_port(),
            h2c_port: default_h2c_port(),
            seed: None,
            only: false,
        }
    }
}

/// Client-only mode configuration
#[derive(Debug, Deserialize, Default)]
pub struct ClientConfig {
    pub url: Option<String>,
    #[serde(default)]
    pub h2c: bool,
}

/// Predefined test configuration
#[derive(Debug, Deserialize)]
pub struct TestsConfig {
    #[serde(default = "default_test_size")]
    pub size: u64,
    #[serde(default = "default_true")]
    pub http1: bool,
    #[serde(default = "default_true")]
    pub h2c: bool,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            size: default_test_size(),
            http1: true,
            h2c: true,
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http1_port() -> u16 {
    8765
}

fn default_h2c_port() -> u16 {
    9876
}

fn default_test_size() -> u64 {
    DEFAULT_TEST_SIZE
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// What the process does once configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Start both servers and run the enabled predefined tests
    Bench,
    /// Start both servers and wait for a shutdown signal
    ServerOnly,
    /// Download one URL, no local servers
    ClientOnly { url: String, protocol: Protocol },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub host: String,
    pub http1_port: u16,
    pub h2c_port: u16,
    pub seed: u64,
    pub test_size: u64,
    pub http1_test: bool,
    pub h2c_test: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server_only = cli.server || toml_config.server.only;
        let url = cli.url.or(toml_config.client.url);

        let mode = match (server_only, url) {
            (true, Some(_)) => {
                return Err(ConfigError::Conflict(
                    "server-only mode and a client URL are mutually exclusive".to_string(),
                ))
            }
            (true, None) => Mode::ServerOnly,
            (false, Some(url)) => Mode::ClientOnly {
                url,
                protocol: if cli.h2c || toml_config.client.h2c {
                    Protocol::H2c
                } else {
                    Protocol::Http1
                },
            },
            (false, None) => Mode::Bench,
        };

        Ok(Config {
            mode,
            host: cli.host.unwrap_or(toml_config.server.host),
            http1_port: cli.http1_port.unwrap_or(toml_config.server.http1_port),
            h2c_port: cli.h2c_port.unwrap_or(toml_config.server.h2c_port),
            seed: cli
                .seed
                .or(toml_config.server.seed)
                .unwrap_or_else(clock_seed),
            test_size: cli.size.unwrap_or(toml_config.tests.size),
            http1_test: !cli.no_http1 && toml_config.tests.http1,
            h2c_test: !cli.no_h2c && toml_config.tests.h2c,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Conflict(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Conflict(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["h2c-speed"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.mode, Mode::Bench);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.http1_port, 8765);
        assert_eq!(config.h2c_port, 9876);
        assert_eq!(config.test_size, 10_000_000_000);
        assert!(config.http1_test);
        assert!(config.h2c_test);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            http1_port = 18765
            h2c_port = 19876
            seed = 42

            [tests]
            size = 1000000
            h2c = false

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.host, "127.0.0.1");
        assert_eq!(toml_config.server.seed, Some(42));
        assert!(toml_config.tests.http1);

        let config = Config::merge(cli(&[]), toml_config).unwrap();
        assert_eq!(config.http1_port, 18765);
        assert_eq!(config.h2c_port, 19876);
        assert_eq!(config.seed, 42);
        assert_eq!(config.test_size, 1_000_000);
        assert!(config.http1_test);
        assert!(!config.h2c_test);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_precedence() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            http1_port = 1111
            seed = 1

            [tests]
            size = 5
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&[
                "--http1-port",
                "2222",
                "--seed",
                "2",
                "-n",
                "7",
                "--no-http1",
                "--log-level",
                "warn",
            ]),
            toml_config,
        )
        .unwrap();
        assert_eq!(config.http1_port, 2222);
        assert_eq!(config.seed, 2);
        assert_eq!(config.test_size, 7);
        assert!(!config.http1_test);
        assert!(config.h2c_test);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_modes() {
        let config = Config::merge(cli(&["-s"]), TomlConfig::default()).unwrap();
        assert_eq!(config.mode, Mode::ServerOnly);

        let config = Config::merge(
            cli(&["--url", "http://localhost:9876/100", "--h2c"]),
            TomlConfig::default(),
        )
        .unwrap();
        assert_eq!(
            config.mode,
            Mode::ClientOnly {
                url: "http://localhost:9876/100".to_string(),
                protocol: Protocol::H2c,
            }
        );

        let config =
            Config::merge(cli(&["-u", "http://localhost:8765/1"]), TomlConfig::default()).unwrap();
        assert!(matches!(config.mode, Mode::ClientOnly { protocol: Protocol::Http1, .. }));
    }

    #[test]
    fn test_conflicting_modes() {
        assert!(CliArgs::try_parse_from(["h2c-speed", "-s", "-u", "http://x/1"]).is_err());

        let toml_config: TomlConfig = toml::from_str(
            r#"
            [client]
            url = "http://localhost:8765/1"
        "#,
        )
        .unwrap();
        let err = Config::merge(cli(&["-s"]), toml_config).unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)));
    }
}
