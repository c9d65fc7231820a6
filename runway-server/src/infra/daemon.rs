//! Subsystem wiring for `runwayd`.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use runway_core::{
    MIGRATOR,
    agents::{AgentAuthenticator, AgentManager, AgentSweeper, HmacAgentTokens},
    allocator::JobAllocator,
    events::{EventStream, PgEventListener},
    lock::{LockProvider, PgLockProvider},
    logs::LogStore,
    notifier::{Notifier, TracingSink},
    persistence::{AgentRepository, PostgresStore, Store},
    runs::RunService,
    scheduler::Scheduler,
    supervisor::{Subsystem, Supervisor},
};
use runway_model::DaemonConfig;

use super::{config::Config, shutdown, startup};

/// Handles an API layer uses to drive the control plane.
pub struct ControlPlane<S> {
    pub runs: Arc<RunService<S>>,
    pub logs: Arc<LogStore<S>>,
    pub agents: Arc<AgentManager<S>>,
}

impl<S> std::fmt::Debug for ControlPlane<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane").finish_non_exhaustive()
    }
}

/// Everything built from one store, before anything is started.
pub struct Assembly<S> {
    pub control_plane: ControlPlane<S>,
    /// Exclusive subsystems, in start order.
    pub subsystems: Vec<Arc<dyn Subsystem>>,
}

impl<S> std::fmt::Debug for Assembly<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.subsystems.iter().map(|s| s.name()).collect();
        f.debug_struct("Assembly")
            .field("subsystems", &names)
            .finish_non_exhaustive()
    }
}

pub fn assemble<S: Store>(
    store: Arc<S>,
    events: Arc<dyn EventStream>,
    config: &DaemonConfig,
    authenticator: Option<Arc<dyn AgentAuthenticator>>,
) -> Assembly<S> {
    let mut agents = AgentManager::new(Arc::clone(&store), Arc::clone(&events), config.agents.clone());
    if let Some(authenticator) = authenticator {
        agents = agents.with_authenticator(authenticator);
    }
    let agents = Arc::new(agents);

    let subsystems: Vec<Arc<dyn Subsystem>> = vec![
        Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&events),
            config.scheduler.clone(),
        )),
        Arc::new(JobAllocator::new(
            Arc::clone(&store),
            Arc::clone(&events),
            config.allocator.clone(),
            config.agents.clone(),
        )),
        Arc::new(AgentSweeper::new(Arc::clone(&agents))),
        Arc::new(Notifier::new(events, Arc::new(TracingSink))),
    ];

    Assembly {
        control_plane: ControlPlane {
            runs: Arc::new(RunService::new(
                Arc::clone(&store),
                config.agents.default_pool.clone(),
            )),
            logs: Arc::new(LogStore::new(store, config.logs.clone())),
            agents,
        },
        subsystems,
    }
}

/// Validates the lock table against `subsystems` and starts each one.
pub fn start_subsystems(
    supervisor: &Supervisor,
    subsystems: &[Arc<dyn Subsystem>],
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    supervisor
        .validate(subsystems)
        .context("lock table does not cover every subsystem")?;
    subsystems
        .iter()
        .map(|subsystem| {
            supervisor
                .start(cancel.clone(), Arc::clone(subsystem))
                .with_context(|| format!("failed to start {}", subsystem.name()))
        })
        .collect()
}

pub struct Daemon {
    config: Config,
    pool: PgPool,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config_path", &self.config.metadata.config_path)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(config.database_url()?)
            .await
            .context("failed to connect to PostgreSQL")?;
        Ok(Self { config, pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("database migration failed")?;
        info!("database migrations applied");
        Ok(())
    }

    /// Token for agents joining the named pool, creating the pool if needed.
    pub async fn issue_agent_token(&self, pool_name: &str) -> Result<String> {
        let secret = self
            .config
            .agent_token_secret
            .as_deref()
            .context("RUNWAY_AGENT_TOKEN_SECRET is not configured")?;
        let tokens = HmacAgentTokens::from_hex(secret)?;
        let store = PostgresStore::new(self.pool.clone(), self.config.daemon.events.channel.clone());
        let pool = store.ensure_pool(pool_name).await?;
        Ok(tokens.issue(pool.id)?)
    }

    /// Runs every subsystem until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let Daemon { config, pool } = self;
        let daemon = &config.daemon;

        let store = Arc::new(PostgresStore::new(pool.clone(), daemon.events.channel.clone()));
        store
            .verify_schema()
            .await
            .context("database schema is not current; run `runwayd db migrate`")?;

        let authenticator = match &config.agent_token_secret {
            Some(secret) => {
                let tokens: Arc<dyn AgentAuthenticator> = Arc::new(HmacAgentTokens::from_hex(secret)?);
                Some(tokens)
            }
            None => None,
        };

        let locks: Arc<dyn LockProvider> = Arc::new(PgLockProvider::new(
            pool.clone(),
            daemon.supervisor.lock_probe_interval(),
        ));
        let supervisor = Supervisor::new(locks, daemon.locks.clone(), daemon.supervisor.clone());

        let listener = Arc::new(PgEventListener::new(
            pool.clone(),
            &daemon.events,
            daemon.supervisor.clone(),
        ));
        let events: Arc<dyn EventStream> = listener.clone();
        let mut handles = vec![supervisor.start(shutdown.clone(), listener)?];

        if let Err(err) =
            startup::await_event_listener(events.as_ref(), daemon.startup.listener_timeout()).await
        {
            shutdown.cancel();
            shutdown::drain(handles, daemon.startup.shutdown_grace()).await;
            pool.close().await;
            return Err(err);
        }

        let assembly = assemble(Arc::clone(&store), events, daemon, authenticator);
        handles.extend(start_subsystems(&supervisor, &assembly.subsystems, &shutdown)?);
        info!(subsystems = assembly.subsystems.len(), "subsystems started");

        let readiness = {
            let agents = Arc::clone(&assembly.control_plane.agents);
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = startup::await_first_agent(agents, cancel).await {
                    error!(error = %err, "readiness check failed");
                }
            })
        };

        shutdown.cancelled().await;
        info!("stopping subsystems");
        readiness.abort();
        let aborted = shutdown::drain(handles, daemon.startup.shutdown_grace()).await;
        if aborted > 0 {
            warn!(aborted, "some subsystems did not stop in time");
        }
        pool.close().await;
        info!("shutdown complete");
        Ok(())
    }
}
