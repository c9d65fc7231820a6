use std::path::PathBuf;

use runway_model::DaemonConfig;
use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file. Daemon tunables sit at the
/// top level (`[supervisor]`, `[agents]`, `[locks]`, ...).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub tracing: FileTracingConfig,
    #[serde(default)]
    pub auth: FileAuthConfig,
    #[serde(flatten)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileTracingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_token_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_token_secret_file: Option<PathBuf>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub database_max_connections: Option<u32>,
    pub agent_token_secret: Option<String>,
    pub agent_token_secret_file: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub default_pool: Option<String>,
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty("RUNWAY_CONFIG").map(PathBuf::from),
            database_url: non_empty("DATABASE_URL"),
            database_url_file: non_empty("DATABASE_URL_FILE").map(PathBuf::from),
            database_max_connections: non_empty("DATABASE_MAX_CONNECTIONS")
                .and_then(|value| value.parse().ok()),
            agent_token_secret: non_empty("RUNWAY_AGENT_TOKEN_SECRET"),
            agent_token_secret_file: non_empty("RUNWAY_AGENT_TOKEN_SECRET_FILE")
                .map(PathBuf::from),
            log_filter: non_empty("RUNWAY_LOG"),
            default_pool: non_empty("RUNWAY_DEFAULT_POOL"),
        }
    }
}
