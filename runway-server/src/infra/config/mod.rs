//! Layered daemon configuration: defaults, TOML file, environment, CLI.

pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, ConfigWarning, ConfigWarnings, DatabaseConfig,
};
