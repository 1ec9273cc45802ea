//! Gateway configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! then `DITING_*` environment variables. The merged result is validated once
//! at startup; a bad value is fatal.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::DEFAULT_TOKEN_TTL;
use crate::heartbeat::HeartbeatConfig;
use crate::lifecycle::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid config: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5001)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub write_timeout_secs: u64,
    /// Read and write buffer size for the WebSocket upgrade, in bytes.
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: 5,
            buffer_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_days: u64,
    /// Bearer key for `POST /api/push/{uid}`. Unset disables the endpoint.
    pub push_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_days: DEFAULT_TOKEN_TTL.as_secs() / 86_400,
            push_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatSection,
    pub transport: TransportConfig,
    pub auth: AuthConfig,
}

impl PushConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `DITING_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("DITING_BIND") {
            self.server.bind = parse_env("DITING_BIND", raw)?;
        }
        if let Some(raw) = lookup("DITING_JWT_SECRET") {
            self.auth.jwt_secret = raw;
        }
        if let Some(raw) = lookup("DITING_PUSH_KEY") {
            self.auth.push_key = Some(raw).filter(|k| !k.is_empty());
        }
        if let Some(raw) = lookup("DITING_HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat.interval_secs = parse_env("DITING_HEARTBEAT_INTERVAL_SECS", raw)?;
        }
        if let Some(raw) = lookup("DITING_HEARTBEAT_TIMEOUT_SECS") {
            self.heartbeat.timeout_secs = parse_env("DITING_HEARTBEAT_TIMEOUT_SECS", raw)?;
        }
        if let Some(raw) = lookup("DITING_WRITE_TIMEOUT_SECS") {
            self.transport.write_timeout_secs = parse_env("DITING_WRITE_TIMEOUT_SECS", raw)?;
        }
        if let Some(raw) = lookup("DITING_BUFFER_SIZE") {
            self.transport.buffer_size = parse_env("DITING_BUFFER_SIZE", raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &'static str, &'static str); 6] = [
            (self.heartbeat.interval_secs > 0, "heartbeat.interval_secs", "must be > 0"),
            (self.heartbeat.timeout_secs > 0, "heartbeat.timeout_secs", "must be > 0"),
            (self.transport.write_timeout_secs > 0, "transport.write_timeout_secs", "must be > 0"),
            (self.transport.buffer_size > 0, "transport.buffer_size", "must be > 0"),
            (!self.auth.jwt_secret.is_empty(), "auth.jwt_secret", "must be set"),
            (self.auth.token_ttl_days > 0, "auth.token_ttl_days", "must be > 0"),
        ];
        match checks.iter().find(|(ok, _, _)| !ok) {
            Some(&(_, field, reason)) => Err(ConfigError::Invalid { field, reason }),
            None => Ok(()),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.heartbeat.interval_secs),
                timeout: Duration::from_secs(self.heartbeat.timeout_secs),
            },
            write_timeout: Duration::from_secs(self.transport.write_timeout_secs),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_days * 86_400)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value: raw })
}
