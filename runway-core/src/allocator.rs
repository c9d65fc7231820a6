//! Matches unscheduled jobs to agents.
//!
//! Within a pool jobs are served strictly oldest first and each goes to the
//! least-loaded live agent (ties: earliest registration, then id). When the
//! oldest job of a pool cannot be placed the pool is done for this pass, so
//! a newer job never jumps ahead of it.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use runway_model::{
    Agent, AgentConfig, AgentId, AgentPoolId, AllocatorConfig, EventKind, Job,
    JobId, lock,
};

use crate::{
    error::{Result, RunwayError},
    events::EventStream,
    persistence::{AgentRepository, JobRepository},
    supervisor::Subsystem,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationReport {
    pub allocated: Vec<(JobId, AgentId)>,
    /// Jobs left unscheduled because their pool had no spare capacity.
    pub starved: usize,
    /// Writes that lost an optimistic check; the next pass re-reads them.
    pub conflicts: usize,
}

pub struct JobAllocator<S> {
    store: Arc<S>,
    events: Arc<dyn EventStream>,
    config: AllocatorConfig,
    liveness: AgentConfig,
}

impl<S> std::fmt::Debug for JobAllocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobAllocator")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.config)
            .finish()
    }
}

fn group_by_pool(jobs: Vec<Job>) -> BTreeMap<AgentPoolId, Vec<Job>> {
    let mut pools: BTreeMap<AgentPoolId, Vec<Job>> = BTreeMap::new();
    for job in jobs {
        pools.entry(job.pool_id).or_default().push(job);
    }
    for queue in pools.values_mut() {
        queue.sort_by_key(Job::queue_key);
    }
    pools
}

/// Least-loaded agent with spare capacity.
fn pick(agents: &[Agent]) -> Option<usize> {
    agents
        .iter()
        .enumerate()
        .filter(|(_, agent)| agent.accepts_work())
        .min_by_key(|(_, agent)| (agent.load, agent.registered_at, agent.id))
        .map(|(index, _)| index)
}

impl<S> JobAllocator<S>
where
    S: JobRepository + AgentRepository + 'static,
{
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn EventStream>,
        config: AllocatorConfig,
        liveness: AgentConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
            liveness,
        }
    }

    /// One pass over every unscheduled job.
    #[instrument(skip(self), target = "runway::allocator")]
    pub async fn allocate(&self) -> Result<AllocationReport> {
        let mut report = AllocationReport::default();
        let pools = group_by_pool(self.store.unscheduled_jobs().await?);
        let horizon = chrono::Duration::from_std(self.liveness.liveness_timeout())
            .map_err(|err| RunwayError::InvariantViolation(format!("liveness timeout: {err}")))?;
        let cutoff = Utc::now() - horizon;

        for (pool, queue) in pools {
            // Agents past the liveness horizon are about to be evicted.
            let mut agents: Vec<Agent> = self
                .store
                .list_agents(Some(pool))
                .await?
                .into_iter()
                .filter(|agent| !agent.is_stale(cutoff))
                .collect();

            let waiting = queue.len();
            for (served, job) in queue.into_iter().enumerate() {
                let Some(index) = pick(&agents) else {
                    report.starved += waiting - served;
                    debug!(target: "runway::allocator", %pool, waiting = waiting - served, "no spare capacity");
                    break;
                };
                let agent = &mut agents[index];
                match self.store.allocate_job(job.id, job.version, agent.id).await {
                    Ok(_) => {
                        agent.load += 1;
                        info!(target: "runway::allocator", job = %job.id, agent = %agent.id, load = agent.load, "job allocated");
                        report.allocated.push((job.id, agent.id));
                    }
                    Err(RunwayError::Conflict(reason)) => {
                        debug!(target: "runway::allocator", job = %job.id, %reason, "allocation lost a race; re-evaluating later");
                        report.conflicts += 1;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(report)
    }

    async fn pass(&self) {
        match self.allocate().await {
            Ok(report) if report.conflicts > 0 => {
                // Conflicting pools were abandoned mid-pass; take a fresh look.
                if let Err(err) = self.allocate().await {
                    warn!(target: "runway::allocator", error = %err, "allocation pass failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target: "runway::allocator", error = %err, "allocation pass failed; retrying on next event");
            }
        }
    }
}

/// Events after which some job may now be placeable.
const WAKE_ON: [EventKind; 5] = [
    EventKind::JobRunnable,
    EventKind::JobFinished,
    EventKind::AgentRegistered,
    EventKind::AgentHeartbeat,
    EventKind::AgentDeparted,
];

#[async_trait]
impl<S> Subsystem for JobAllocator<S>
where
    S: JobRepository + AgentRepository + 'static,
{
    fn name(&self) -> &str {
        lock::JOB_ALLOCATOR
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self.events.subscribe(&WAKE_ON);
        self.pass().await;

        let mut resync = tokio::time::interval(self.config.resync_interval());
        resync.tick().await;
        info!(target: "runway::allocator", "job allocator running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => self.pass().await,
                notification = events.recv() => {
                    if notification.is_none() {
                        return Err(RunwayError::Internal("event stream closed".into()));
                    }
                    // Coalesce a burst into one pass.
                    while events.try_recv().is_some() {}
                    self.pass().await;
                }
            }
        }
        info!(target: "runway::allocator", "job allocator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_model::{AgentStatus, JobStatus, Phase, RunId};

    fn agent(load: u32, capacity: u32, registered_secs: i64) -> Agent {
        let at = chrono::DateTime::from_timestamp(registered_secs, 0).unwrap();
        Agent {
            id: AgentId::new(),
            pool_id: AgentPoolId::new(),
            name: "a".into(),
            version: None,
            status: AgentStatus::Idle,
            capacity,
            load,
            reported_load: load,
            registered_at: at,
            last_seen_at: at,
        }
    }

    #[test]
    fn least_loaded_agent_wins() {
        let agents = vec![agent(1, 4, 0), agent(0, 4, 10), agent(0, 4, 5)];
        assert_eq!(pick(&agents), Some(2));
    }

    #[test]
    fn full_agents_are_skipped() {
        let agents = vec![agent(2, 2, 0), agent(3, 4, 1)];
        assert_eq!(pick(&agents), Some(1));
        assert_eq!(pick(&[agent(1, 1, 0)]), None);
    }

    #[test]
    fn jobs_group_oldest_first_per_pool() {
        let pool = AgentPoolId::new();
        let job = |secs: i64| {
            let at = chrono::DateTime::from_timestamp(secs, 0).unwrap();
            Job {
                id: JobId::new(),
                run_id: RunId::new(),
                phase: Phase::Plan,
                pool_id: pool,
                status: JobStatus::Unscheduled,
                agent_id: None,
                version: 0,
                created_at: at,
                updated_at: at,
            }
        };
        let grouped = group_by_pool(vec![job(30), job(10), job(20)]);
        let order: Vec<i64> = grouped[&pool]
            .iter()
            .map(|job| job.created_at.timestamp())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }
}
