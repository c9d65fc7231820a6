//! # runwayd
//!
//! Control-plane daemon for Runway: schedules infrastructure runs onto a
//! fleet of remote agents. Every replica runs the same binary; exclusive
//! subsystems are elected through Postgres advisory locks.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_server::infra::{
    config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
    daemon::Daemon,
    shutdown, telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "runwayd")]
#[command(about = "Runway control-plane daemon")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Path to runway.toml (overrides RUNWAY_CONFIG and default locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file to load before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Database URL (overrides DATABASE_URL and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control plane until SIGINT/SIGTERM (the default)
    Serve,
    #[command(subcommand)]
    Db(DbCommand),
    /// Print an agent registration token scoped to a pool
    AgentToken {
        #[arg(long)]
        pool: String,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.global)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let daemon = Daemon::connect(config).await?;
            let shutdown = CancellationToken::new();
            shutdown::cancel_on_signal(shutdown.clone());
            daemon.serve(shutdown).await
        }
        Command::Db(DbCommand::Migrate) => Daemon::connect(config).await?.migrate().await,
        Command::AgentToken { pool } => {
            let token = Daemon::connect(config)
                .await?
                .issue_agent_token(&pool)
                .await?;
            println!("{token}");
            Ok(())
        }
    }
}

fn load_runtime_config(args: &GlobalArgs) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
        database_url: args.database_url.clone(),
        log_filter: args.log.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    telemetry::init(&config.log_filter)?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let daemon = &config.daemon;
    info!(
        default_pool = %daemon.agents.default_pool,
        liveness_timeout_ms = daemon.agents.liveness_timeout_ms,
        scheduler_resync_ms = daemon.scheduler.resync_interval_ms,
        event_channel = %daemon.events.channel,
        "configuration in effect"
    );
    Ok(config)
}
