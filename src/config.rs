//! Environment-driven settings. CLI flags override these through the `with_*` setters.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::structure::store::SquadStore;

pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";
pub const DEFAULT_TEMPERATURE: f32 = 0.4;
pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, thiserror::Error)]
#[error("invalid {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file (SQUAD_STORE_PATH).
    pub store_path: PathBuf,
    /// Model used when the active prompt version does not pin one (SQUAD_MODEL).
    pub model: String,
    /// SQUAD_TEMPERATURE.
    pub temperature: f32,
    /// SQUAD_MAX_TOKENS.
    pub max_tokens: u32,
    /// HTTP listen address (SQUAD_BIND).
    pub bind: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(".squad_harness.sqlite"),
            model: DEFAULT_MODEL.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            store_path: SquadStore::default_path(),
            ..Self::default()
        };
        if let Some(model) = env_opt("SQUAD_MODEL") {
            config.model = model;
        }
        if let Some(value) = env_opt("SQUAD_TEMPERATURE") {
            config.temperature = parse_env("SQUAD_TEMPERATURE", &value)?;
            if !(0.0..=2.0).contains(&config.temperature) {
                return Err(ConfigError {
                    var: "SQUAD_TEMPERATURE",
                    value,
                    reason: "must be between 0.0 and 2.0".into(),
                });
            }
        }
        if let Some(value) = env_opt("SQUAD_MAX_TOKENS") {
            config.max_tokens = parse_env("SQUAD_MAX_TOKENS", &value)?;
        }
        if let Some(value) = env_opt("SQUAD_BIND") {
            config.bind = parse_env("SQUAD_BIND", &value)?;
        }
        Ok(config)
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
