//! Agent registration, liveness and the job hand-off protocol.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use runway_model::{
    Agent, AgentConfig, AgentId, AgentRegistration, AgentStatus, Event, EventKind,
    Job, JobId, JobStatus,
};

use crate::{
    error::{Result, RunwayError},
    events::{EventStream, Notification},
    persistence::{JobCompletion, NewAgent, Retirement, Store},
};

pub mod auth;
pub mod sweeper;

pub use auth::{AgentAuthenticator, HmacAgentTokens};
pub use sweeper::AgentSweeper;

pub struct AgentManager<S> {
    store: Arc<S>,
    events: Arc<dyn EventStream>,
    config: AgentConfig,
    authenticator: Option<Arc<dyn AgentAuthenticator>>,
}

impl<S> std::fmt::Debug for AgentManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.config)
            .field("token_auth", &self.authenticator.is_some())
            .finish()
    }
}

impl<S: Store> AgentManager<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn EventStream>, config: AgentConfig) -> Self {
        Self {
            store,
            events,
            config,
            authenticator: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn AgentAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn reject(message: String) -> RunwayError {
        error!(target: "runway::agents", %message, "rejected agent request");
        RunwayError::InvariantViolation(message)
    }

    /// Registers a new agent as `pending` in the requested pool, or the
    /// default pool when none is given.
    #[instrument(skip(self, registration), target = "runway::agents", fields(name = %registration.name))]
    pub async fn register(&self, registration: AgentRegistration) -> Result<Agent> {
        if registration.name.trim().is_empty() {
            return Err(Self::reject("agent name must not be empty".into()));
        }
        if registration.capacity == 0 || registration.capacity > self.config.max_capacity {
            return Err(Self::reject(format!(
                "capacity {} is outside 1..={}",
                registration.capacity, self.config.max_capacity
            )));
        }
        let pool = match registration.pool_id {
            Some(id) => self.store.get_pool(id).await?,
            None => self.store.ensure_pool(&self.config.default_pool).await?,
        };
        let agent = self
            .store
            .insert_agent(NewAgent {
                name: registration.name,
                pool_id: pool.id,
                capacity: registration.capacity,
                version: registration.version,
                registered_at: Utc::now(),
            })
            .await?;
        info!(
            target: "runway::agents",
            agent = %agent.id,
            pool = %pool.name,
            capacity = agent.capacity,
            "agent registered"
        );
        Ok(agent)
    }

    /// Registers an agent presenting a pool-scoped token.
    pub async fn register_with_token(
        &self,
        token: &str,
        mut registration: AgentRegistration,
    ) -> Result<Agent> {
        let authenticator = self
            .authenticator
            .as_ref()
            .ok_or_else(|| RunwayError::Unauthorized("agent tokens are not configured".into()))?;
        let pool = authenticator.authenticate(token)?;
        if registration.pool_id.is_some_and(|requested| requested != pool) {
            return Err(RunwayError::Unauthorized(format!(
                "token is not valid for the requested pool; it is scoped to {pool}"
            )));
        }
        registration.pool_id = Some(pool);
        self.register(registration).await
    }

    /// Records liveness. `NotFound` tells the agent to re-register.
    pub async fn heartbeat(&self, id: AgentId, status: AgentStatus, load: u32) -> Result<Agent> {
        let agent = self.store.get_agent(id).await?;
        if agent.status.is_retired() {
            return Err(RunwayError::NotFound(format!(
                "agent {id} has been retired; register again"
            )));
        }
        if load > agent.capacity {
            return Err(Self::reject(format!(
                "agent {id} reports load {load} above capacity {}",
                agent.capacity
            )));
        }
        match status {
            AgentStatus::Idle | AgentStatus::Busy => {}
            AgentStatus::Errored | AgentStatus::Exited => {
                warn!(target: "runway::agents", agent = %id, %status, "agent reported itself retired");
                return Ok(self.store.retire_agent(id, status, false).await?.agent);
            }
            AgentStatus::Pending => {
                return Err(Self::reject(format!("agent {id} cannot report status pending")));
            }
        }

        let updated = self.store.record_heartbeat(id, load, Utc::now()).await?;
        if updated.load != load {
            debug!(
                target: "runway::agents",
                agent = %id,
                reported = load,
                assigned = updated.load,
                "reported load differs from assigned jobs"
            );
        }
        Ok(updated)
    }

    /// Marks the agent exited and hands its jobs back to the allocator.
    pub async fn deregister(&self, id: AgentId) -> Result<Retirement> {
        let retirement = self.store.retire_agent(id, AgentStatus::Exited, false).await?;
        info!(
            target: "runway::agents",
            agent = %id,
            released = retirement.released_jobs.len(),
            "agent deregistered"
        );
        Ok(retirement)
    }

    /// Evicts every agent silent for longer than the liveness timeout.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Retirement>> {
        let horizon = chrono::Duration::from_std(self.config.liveness_timeout())
            .map_err(|err| RunwayError::InvariantViolation(format!("liveness timeout: {err}")))?;
        let cutoff = now - horizon;
        let mut evicted = Vec::new();
        for agent in self.store.stale_agents(cutoff).await? {
            match self.store.evict_agent(agent.id, cutoff).await {
                Ok(None) => {
                    debug!(target: "runway::agents", agent = %agent.id, "agent heartbeat arrived before eviction");
                }
                Ok(Some(retirement)) => {
                    warn!(
                        target: "runway::agents",
                        agent = %agent.id,
                        last_seen = %agent.last_seen_at,
                        released = retirement.released_jobs.len(),
                        "evicted unresponsive agent"
                    );
                    evicted.push(retirement);
                }
                Err(RunwayError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(evicted)
    }

    /// Long-poll for work: jobs allocated to the agent and not yet started,
    /// waiting up to `timeout` for one to arrive.
    pub async fn await_jobs(&self, id: AgentId, timeout: Duration) -> Result<Vec<Job>> {
        let mut events = self
            .events
            .subscribe(&[EventKind::JobAllocated, EventKind::AgentDeparted]);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let agent = self.store.get_agent(id).await?;
            if agent.status.is_retired() {
                return Err(RunwayError::NotFound(format!(
                    "agent {id} has been retired; register again"
                )));
            }
            let ready: Vec<Job> = self
                .store
                .assigned_jobs(id)
                .await?
                .into_iter()
                .filter(|job| job.status == JobStatus::Allocated)
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }

            loop {
                let notification = match tokio::time::timeout_at(deadline, events.recv()).await {
                    Err(_) => return Ok(Vec::new()),
                    Ok(None) => return Err(RunwayError::Internal("event stream closed".into())),
                    Ok(Some(notification)) => notification,
                };
                let relevant = match notification {
                    Notification::Resync => true,
                    Notification::Event(Event::JobAllocated { agent_id, .. })
                    | Notification::Event(Event::AgentDeparted { agent_id, .. }) => agent_id == id,
                    Notification::Event(_) => false,
                };
                if relevant {
                    break;
                }
            }
        }
    }

    pub async fn start_job(&self, agent: AgentId, job: JobId) -> Result<Job> {
        let started = self.store.start_job(job, agent).await?;
        debug!(target: "runway::agents", %agent, %job, "job started");
        Ok(started)
    }

    pub async fn finish_job(
        &self,
        agent: AgentId,
        job: JobId,
        outcome: JobStatus,
    ) -> Result<JobCompletion> {
        let completion = self.store.finish_job(job, agent, outcome).await?;
        info!(
            target: "runway::agents",
            %agent,
            %job,
            %outcome,
            run = %completion.run.id,
            run_status = %completion.run.status,
            "job finished"
        );
        Ok(completion)
    }

    /// Resolves once any agent is registered, or `false` on cancellation.
    pub async fn wait_for_first_agent(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut events = self.events.subscribe(&[EventKind::AgentRegistered]);
        loop {
            if !self.store.list_agents(None).await?.is_empty() {
                return Ok(true);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                notification = events.recv() => {
                    if notification.is_none() {
                        return Err(RunwayError::Internal("event stream closed".into()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agents::auth::MockAgentAuthenticator,
        events::InProcEventBus,
        persistence::{AgentRepository, InMemoryStore},
    };
    use runway_model::AgentPoolId;

    fn manager(max_capacity: u32) -> AgentManager<InMemoryStore> {
        let bus = InProcEventBus::new(64);
        let store = Arc::new(InMemoryStore::new(bus.clone()));
        AgentManager::new(
            store,
            Arc::new(bus),
            AgentConfig {
                max_capacity,
                ..AgentConfig::default()
            },
        )
    }

    fn registration(capacity: u32) -> AgentRegistration {
        AgentRegistration {
            name: "agent-1".into(),
            pool_id: None,
            capacity,
            version: Some("1.0.0".into()),
        }
    }

    #[tokio::test]
    async fn registration_lands_in_default_pool() {
        let manager = manager(8);
        let agent = manager.register(registration(2)).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Pending);
        let pool = manager.store.get_pool(agent.pool_id).await.unwrap();
        assert_eq!(pool.name, "default");
    }

    #[tokio::test]
    async fn capacity_bounds_are_enforced() {
        let manager = manager(4);
        for capacity in [0, 5] {
            assert!(matches!(
                manager.register(registration(capacity)).await,
                Err(RunwayError::InvariantViolation(_))
            ));
        }
    }

    #[tokio::test]
    async fn unknown_pool_is_not_found() {
        let manager = manager(4);
        let mut request = registration(1);
        request.pool_id = Some(AgentPoolId::new());
        assert!(matches!(
            manager.register(request).await,
            Err(RunwayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_after_deregister_is_not_found() {
        let manager = manager(4);
        let agent = manager.register(registration(2)).await.unwrap();
        let beat = manager.heartbeat(agent.id, AgentStatus::Idle, 0).await.unwrap();
        assert_eq!(beat.status, AgentStatus::Idle);

        manager.deregister(agent.id).await.unwrap();
        assert!(matches!(
            manager.heartbeat(agent.id, AgentStatus::Idle, 0).await,
            Err(RunwayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn overloaded_heartbeat_is_rejected() {
        let manager = manager(4);
        let agent = manager.register(registration(2)).await.unwrap();
        assert!(matches!(
            manager.heartbeat(agent.id, AgentStatus::Busy, 3).await,
            Err(RunwayError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn token_registration_uses_the_token_pool() {
        let manager = manager(4);
        let pool = manager.store.ensure_pool("gpu").await.unwrap();
        let mut auth = MockAgentAuthenticator::new();
        auth.expect_authenticate()
            .withf(|token| token.to_string() == "good")
            .returning(move |_| Ok(pool.id));
        let manager = manager.with_authenticator(Arc::new(auth));

        let agent = manager
            .register_with_token("good", registration(1))
            .await
            .unwrap();
        let stored = manager.store.get_pool(agent.pool_id).await.unwrap();
        assert_eq!(stored.name, "gpu");

        let mut mismatched = registration(1);
        mismatched.pool_id = Some(AgentPoolId::new());
        assert!(matches!(
            manager.register_with_token("good", mismatched).await,
            Err(RunwayError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn long_poll_times_out_empty() {
        let manager = manager(4);
        let agent = manager.register(registration(1)).await.unwrap();
        let jobs = manager
            .await_jobs(agent.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(jobs.is_empty());
    }
}
