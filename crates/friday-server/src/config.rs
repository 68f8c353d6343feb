//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

use friday_rtc::EngineKind;
use friday_voice::VoiceConfig;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// WebRTC engine selection.
    #[serde(default)]
    pub rtc: RtcConfig,

    /// Voice collaborator settings.
    #[serde(default)]
    pub voice: VoiceConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "friday_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// WebRTC engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RtcConfig {
    /// Engine implementation to resolve at startup.
    #[serde(default)]
    pub engine: EngineKind,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8787
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Picks the configuration file for this invocation. The first CLI
/// argument wins, then `FRIDAY_CONFIG_PATH`, then `config.toml` in the
/// working directory; the second value names the source for logging.
pub fn resolve_startup_path() -> (String, &'static str) {
    if let Some(path) = std::env::args().nth(1).filter(|p| !p.trim().is_empty()) {
        return (path, "cli");
    }
    if let Some(path) = std::env::var("FRIDAY_CONFIG_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
    {
        return (path, "env");
    }
    ("config.toml".to_string(), "default")
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `FRIDAY_HOST` overrides `server.host`
/// - `FRIDAY_PORT` overrides `server.port`
/// - `FRIDAY_LOG_LEVEL` overrides `logging.level`
/// - `FRIDAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `FRIDAY_RTC_ENGINE` overrides `rtc.engine` ("auto" or "loopback")
/// - the `FRIDAY_*` voice options override their `[voice]` counterparts
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("FRIDAY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("FRIDAY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("FRIDAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("FRIDAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(engine) = std::env::var("FRIDAY_RTC_ENGINE") {
        match engine.as_str() {
            "auto" => config.rtc.engine = EngineKind::Auto,
            "loopback" => config.rtc.engine = EngineKind::Loopback,
            other => tracing::warn!(engine = other, "ignoring unknown FRIDAY_RTC_ENGINE"),
        }
    }
    config.voice.apply_env_overrides();

    Ok(config)
}
