use std::path::PathBuf;

use anyhow::{Result, anyhow};
use runway_model::DaemonConfig;

pub const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 16;

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub daemon: DaemonConfig,
    /// Hex HMAC key for agent tokens; registration is unauthenticated
    /// without one.
    pub agent_token_secret: Option<String>,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().ok_or_else(|| {
            anyhow!("no database configured; set DATABASE_URL or [database].url")
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Where the configuration came from, for startup logging.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
