//! Server configuration: defaults, TOML file loading, and environment
//! overrides.

use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the HTTP server.
    pub port: u16,
    /// Header carrying the request id assigned by the edge.
    pub request_id_header: String,
    /// Header carrying the username authenticated by the identity layer.
    pub identity_header: String,
    /// Buffered events per push stream before backpressure kicks in.
    pub push_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_id_header: "x-request-id".to_string(),
            identity_header: "x-auth-username".to_string(),
            push_channel_capacity: 64,
        }
    }
}

/// Database connection settings. An empty URL selects the in-memory
/// repositories (development and test mode).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level directive (e.g. `info`, `server=debug`).
    pub level: String,
    /// Output format for log events.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// AI companion settings: provider access plus the engine's streaming and
/// context knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    /// Gemini API key. The placeholder `demo` means unconfigured.
    pub api_key: String,
    /// Provider model name.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum tokens per generated reply.
    pub max_tokens: u32,
    /// Timeout for one provider round trip, in seconds.
    pub timeout_seconds: u64,
    /// Lines retained per conversation in the context cache.
    pub context_capacity: usize,
    /// Lines handed to the generator per reply.
    pub context_lines: usize,
    /// Delay between streamed tokens, in milliseconds.
    pub stream_delay_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: "demo".to_string(),
            model: "gemini-1.5-flash".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout_seconds: 30,
            context_capacity: 10,
            context_lines: 5,
            stream_delay_ms: 100,
        }
    }
}

/// The main configuration structure for the Artivio backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Database settings.
    pub database: DatabaseConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// AI companion settings.
    pub ai: AiConfig,
}

impl Config {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Loads the configuration from a TOML file, environment variables, and
    /// an optional port override, in that order of increasing precedence.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resolved configuration fails validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            Config::with_defaults()
        };

        config.apply_env_overrides();

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = env::var("ARTIVIO_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(url) = env::var("ARTIVIO_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = env::var("ARTIVIO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(key) = env::var("ARTIVIO_GEMINI_API_KEY") {
            self.ai.api_key = key;
        }
        if let Ok(model) = env::var("ARTIVIO_GEMINI_MODEL") {
            self.ai.model = model;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid(
                "server port must be greater than 0".to_string(),
            ));
        }
        if self.ai.context_capacity == 0 {
            return Err(ConfigError::Invalid(
                "context capacity must be greater than 0".to_string(),
            ));
        }
        if self.ai.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "generator timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
