use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

use runway_core::agents::HmacAgentTokens;
use runway_model::{ModelError, lock};

use super::{
    models::{
        Config, ConfigMetadata, ConfigWarnings, DEFAULT_LOG_FILTER, DEFAULT_MAX_CONNECTIONS,
        DatabaseConfig,
    },
    sources::{EnvConfig, FileConfig},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["runway.toml", "config/runway.toml"];

/// Subsystems `runwayd serve` runs under a lock.
pub const EXCLUSIVE_SUBSYSTEMS: [&str; 4] = [
    lock::SCHEDULER,
    lock::JOB_ALLOCATOR,
    lock::AGENT_MANAGER,
    lock::NOTIFIER,
];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// CLI overrides, applied last.
    pub database_url: Option<String>,
    pub log_filter: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    /// Reads `.env` (if any) into the process environment, then resolves
    /// every layer.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };
        let mut load = self.load_from(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Resolves configuration against an explicit environment snapshot.
    pub fn load_from(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        self.compose_config(file, env, config_path)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // An explicitly named file must exist; defaults are optional.
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());
        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file = toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok((Some(file), Some(path)))
    }

    fn compose_config(
        &self,
        file: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        if file.is_none() {
            warnings.push_with_hint(
                "No runway.toml detected; using built-in defaults and environment variables",
                "Pass --config or set RUNWAY_CONFIG to point at a configuration file",
            );
        }
        let FileConfig {
            database: file_database,
            tracing: file_tracing,
            auth: file_auth,
            daemon: mut daemon,
        } = file.unwrap_or_default();

        let url = match self.options.database_url.clone().or(env.database_url) {
            Some(url) => Some(url),
            None => match env.database_url_file.as_deref() {
                Some(path) => read_secret_file(path)?,
                None => file_database.url.filter(|url| !url.trim().is_empty()),
            },
        };
        let database = DatabaseConfig {
            url,
            max_connections: env
                .database_max_connections
                .or(file_database.max_connections)
                .unwrap_or(DEFAULT_MAX_CONNECTIONS)
                .max(1),
        };

        if let Some(pool) = env.default_pool {
            daemon.agents.default_pool = pool;
        }
        daemon
            .locks
            .validate(&EXCLUSIVE_SUBSYSTEMS)
            .map_err(ConfigLoadError::Locks)?;
        if daemon.agents.max_capacity == 0 {
            return Err(ConfigLoadError::Invalid(
                "agents.max_capacity must be at least 1".into(),
            ));
        }
        if daemon.agents.default_pool.trim().is_empty() {
            return Err(ConfigLoadError::Invalid(
                "agents.default_pool must not be empty".into(),
            ));
        }

        let agent_token_secret = match env.agent_token_secret {
            Some(secret) => Some(secret),
            None => match env
                .agent_token_secret_file
                .as_deref()
                .or(file_auth.agent_token_secret_file.as_deref())
            {
                Some(path) => read_secret_file(path)?,
                None => file_auth.agent_token_secret,
            },
        };
        match &agent_token_secret {
            Some(secret) => {
                HmacAgentTokens::from_hex(secret)
                    .map_err(|err| ConfigLoadError::AgentTokenSecret(err.to_string()))?;
            }
            None => warnings.push_with_hint(
                "No agent token secret configured; agents register without authentication",
                "Set RUNWAY_AGENT_TOKEN_SECRET to 64 hex characters",
            ),
        }

        let log_filter = self
            .options
            .log_filter
            .clone()
            .or(env.log_filter)
            .or(file_tracing.filter)
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(ConfigLoad {
            config: Config {
                database,
                daemon,
                agent_token_secret,
                log_filter,
                metadata: ConfigMetadata {
                    config_path,
                    env_file_loaded: false,
                },
            },
            warnings,
        })
    }
}

fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let trimmed = contents.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to read secret file {path}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid lock table: {0}")]
    Locks(#[source] ModelError),
    #[error("invalid agent token secret: {0}")]
    AgentTokenSecret(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
