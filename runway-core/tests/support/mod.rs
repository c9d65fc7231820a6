//! In-memory wiring of the scheduling core shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Result, bail};

use runway_core::{
    agents::AgentManager,
    allocator::JobAllocator,
    events::{EventStream, InProcEventBus},
    logs::LogStore,
    persistence::{AgentRepository, InMemoryStore, RunRepository},
    runs::RunService,
    scheduler::Scheduler,
};
use runway_model::{
    Agent, AgentConfig, AgentPool, AgentPoolId, AgentRegistration, AgentStatus,
    AllocatorConfig, Job, LogConfig, Phase, RunId, SchedulerConfig, Workspace,
};

pub struct Harness {
    pub bus: InProcEventBus,
    pub store: Arc<InMemoryStore>,
    pub scheduler: Scheduler<InMemoryStore>,
    pub allocator: JobAllocator<InMemoryStore>,
    pub agents: Arc<AgentManager<InMemoryStore>>,
    pub runs: RunService<InMemoryStore>,
    pub logs: LogStore<InMemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_agent_config(AgentConfig::default())
    }

    pub fn with_agent_config(agent_config: AgentConfig) -> Self {
        let bus = InProcEventBus::new(1024);
        let store = Arc::new(InMemoryStore::new(bus.clone()));
        let events: Arc<dyn EventStream> = Arc::new(bus.clone());
        Self {
            scheduler: Scheduler::new(
                Arc::clone(&store),
                Arc::clone(&events),
                SchedulerConfig::default(),
            ),
            allocator: JobAllocator::new(
                Arc::clone(&store),
                Arc::clone(&events),
                AllocatorConfig::default(),
                agent_config.clone(),
            ),
            runs: RunService::new(Arc::clone(&store), agent_config.default_pool.clone()),
            agents: Arc::new(AgentManager::new(
                Arc::clone(&store),
                events,
                agent_config,
            )),
            logs: LogStore::new(Arc::clone(&store), LogConfig::default()),
            store,
            bus,
        }
    }

    pub async fn workspace(&self, name: &str) -> Result<Workspace> {
        Ok(self.runs.create_workspace(name, None).await?)
    }

    pub async fn pool(&self, name: &str) -> Result<AgentPool> {
        Ok(self.store.ensure_pool(name).await?)
    }

    pub async fn workspace_in(&self, name: &str, pool: AgentPoolId) -> Result<Workspace> {
        Ok(self.runs.create_workspace(name, Some(pool)).await?)
    }

    /// Registers an agent in the default pool and reports it idle.
    pub async fn agent(&self, name: &str, capacity: u32) -> Result<Agent> {
        self.register_idle(name, capacity, None).await
    }

    pub async fn agent_in(&self, name: &str, capacity: u32, pool: AgentPoolId) -> Result<Agent> {
        self.register_idle(name, capacity, Some(pool)).await
    }

    async fn register_idle(
        &self,
        name: &str,
        capacity: u32,
        pool_id: Option<AgentPoolId>,
    ) -> Result<Agent> {
        let agent = self
            .agents
            .register(AgentRegistration {
                name: name.to_string(),
                pool_id,
                capacity,
                version: Some("1.0.0".into()),
            })
            .await?;
        Ok(self.agents.heartbeat(agent.id, AgentStatus::Idle, 0).await?)
    }

    /// Alternates scheduler and allocator passes until neither changes
    /// anything.
    pub async fn settle(&self) -> Result<()> {
        for _ in 0..16 {
            let reconciled = self.scheduler.reconcile_all().await?;
            let allocated = self.allocator.allocate().await?;
            if reconciled.writes == 0 && allocated.allocated.is_empty() {
                return Ok(());
            }
        }
        bail!("scheduling did not settle")
    }

    pub async fn job(&self, run: RunId, phase: Phase) -> Result<Job> {
        let jobs = self.store.jobs_for_run(run).await?;
        match jobs.into_iter().rev().find(|job| job.phase == phase) {
            Some(job) => Ok(job),
            None => bail!("run {run} has no {phase} job"),
        }
    }
}
