use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use runway_model::{
    Agent, AgentId, AgentPool, AgentPoolId, AgentStatus, END_OF_STREAM, Event,
    Job, JobId, JobStatus, LogSlice, Phase, Run, RunId, RunStatus, Workspace,
    WorkspaceId,
};

use super::{
    AgentRepository, JobCompletion, JobRepository, LogRepository, NewAgent,
    NewRun, NewWorkspace, Promotion, Retirement, RunRepository, WorkspaceQueue,
    WorkspaceRepository, check_job_transition, check_run_transition,
    read_window, run_steps_after, status_for_load, stitch,
};
use crate::{
    error::{Result, RunwayError},
    events::InProcEventBus,
};

#[derive(Default)]
struct LogStream {
    chunks: Vec<(u64, Vec<u8>)>,
    length: u64,
    closed: bool,
}

#[derive(Default)]
struct MemoryState {
    pools: HashMap<AgentPoolId, AgentPool>,
    workspaces: HashMap<WorkspaceId, Workspace>,
    runs: HashMap<RunId, Run>,
    jobs: HashMap<JobId, Job>,
    agents: HashMap<AgentId, Agent>,
    logs: HashMap<JobId, LogStream>,
}

impl MemoryState {
    fn workspace_mut(&mut self, id: WorkspaceId) -> Result<&mut Workspace> {
        self.workspaces
            .get_mut(&id)
            .ok_or_else(|| RunwayError::NotFound(format!("workspace {id}")))
    }

    fn run_mut(&mut self, id: RunId) -> Result<&mut Run> {
        self.runs
            .get_mut(&id)
            .ok_or_else(|| RunwayError::NotFound(format!("run {id}")))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| RunwayError::NotFound(format!("job {id}")))
    }

    fn agent_mut(&mut self, id: AgentId) -> Result<&mut Agent> {
        self.agents
            .get_mut(&id)
            .ok_or_else(|| RunwayError::NotFound(format!("agent {id}")))
    }

    fn insert_job(&mut self, run: RunId, phase: Phase, pool: AgentPoolId) -> Result<Job> {
        if self
            .jobs
            .values()
            .any(|job| job.run_id == run && job.phase == phase)
        {
            return Err(RunwayError::Conflict(format!(
                "run {run} already has a {phase} job"
            )));
        }
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            run_id: run,
            phase,
            pool_id: pool,
            status: JobStatus::Unscheduled,
            agent_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn release_slot(&mut self, agent: Option<AgentId>) {
        if let Some(agent) = agent.and_then(|id| self.agents.get_mut(&id))
            && !agent.status.is_retired()
        {
            agent.load = agent.load.saturating_sub(1);
            agent.status = status_for_load(agent.status, agent.load);
        }
    }

    /// Retires a live agent and hands its jobs back as `unscheduled`.
    fn retire(&mut self, id: AgentId, status: AgentStatus) -> Result<Retirement> {
        let agent = self.agent_mut(id)?;
        agent.status = status;
        agent.load = 0;
        let agent = agent.clone();

        let now = Utc::now();
        let mut released_jobs = Vec::new();
        for job in self.jobs.values_mut() {
            if job.agent_id == Some(id) && job.status.holds_agent() {
                job.status = JobStatus::Unscheduled;
                job.agent_id = None;
                job.version += 1;
                job.updated_at = now;
                released_jobs.push(job.clone());
            }
        }
        released_jobs.sort_by_key(Job::queue_key);
        Ok(Retirement {
            agent,
            released_jobs,
        })
    }

    fn set_run_status(&mut self, id: RunId, status: RunStatus) -> Result<Run> {
        let run = self.run_mut(id)?;
        run.status = status;
        run.updated_at = Utc::now();
        let run = run.clone();
        if status.is_terminal()
            && let Some(workspace) = self.workspaces.get_mut(&run.workspace_id)
            && workspace.current_run_id == Some(id)
        {
            workspace.current_run_id = None;
        }
        Ok(run)
    }

    fn pool_of_workspace(&self, id: WorkspaceId) -> Result<AgentPoolId> {
        self.workspaces
            .get(&id)
            .map(|workspace| workspace.pool_id)
            .ok_or_else(|| RunwayError::NotFound(format!("workspace {id}")))
    }
}

/// Store kept entirely in process memory behind one lock.
///
/// Implements the same contract as the Postgres store, publishing events on
/// the bus after each mutation completes.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    events: InProcEventBus,
    faults: AtomicU32,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("events", &self.events)
            .field("pending_faults", &self.faults.load(Ordering::Relaxed))
            .finish()
    }
}

impl InMemoryStore {
    pub fn new(events: InProcEventBus) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            faults: AtomicU32::new(0),
        }
    }

    pub fn events(&self) -> &InProcEventBus {
        &self.events
    }

    /// Makes the next `count` state-changing operations fail with
    /// `Conflict`, as if they lost a race with another writer.
    pub fn fail_next_writes(&self, count: u32) {
        self.faults.store(count, Ordering::SeqCst);
    }

    fn write_guard(&self, op: &str) -> Result<()> {
        let injected = self
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            Err(RunwayError::Conflict(format!("{op}: injected write failure")))
        } else {
            Ok(())
        }
    }

    fn commit(&self, events: Vec<Event>) {
        for event in events {
            self.events.emit(event);
        }
    }

    /// Rewrites a run's creation time; lets tests pin queue order.
    pub async fn set_run_created_at(&self, id: RunId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.run_mut(id)?.created_at = at;
        Ok(())
    }

    /// Rewrites an agent's last heartbeat time.
    pub async fn set_agent_last_seen(&self, id: AgentId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.agent_mut(id)?.last_seen_at = at;
        Ok(())
    }

    /// Points a workspace at an arbitrary run id, bypassing every check.
    pub async fn force_current_run(&self, id: WorkspaceId, run: Option<RunId>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.workspace_mut(id)?.current_run_id = run;
        Ok(())
    }
}

#[async_trait]
impl WorkspaceRepository for InMemoryStore {
    async fn create_workspace(&self, workspace: NewWorkspace) -> Result<Workspace> {
        self.write_guard("create workspace")?;
        let mut state = self.state.lock().await;
        if !state.pools.contains_key(&workspace.pool_id) {
            return Err(RunwayError::NotFound(format!(
                "agent pool {}",
                workspace.pool_id
            )));
        }
        let record = Workspace {
            id: WorkspaceId::new(),
            name: workspace.name,
            pool_id: workspace.pool_id,
            current_run_id: None,
            created_at: Utc::now(),
        };
        state.workspaces.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Workspace> {
        let state = self.state.lock().await;
        state
            .workspaces
            .get(&id)
            .cloned()
            .ok_or_else(|| RunwayError::NotFound(format!("workspace {id}")))
    }

    async fn list_workspace_ids(&self) -> Result<Vec<WorkspaceId>> {
        let state = self.state.lock().await;
        let mut ids: Vec<WorkspaceId> = state.workspaces.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl RunRepository for InMemoryStore {
    async fn create_run(&self, run: NewRun) -> Result<Run> {
        self.write_guard("create run")?;
        let mut state = self.state.lock().await;
        state.pool_of_workspace(run.workspace_id)?;
        let record = Run {
            id: RunId::new(),
            workspace_id: run.workspace_id,
            status: RunStatus::Pending,
            auto_apply: run.auto_apply,
            created_at: run.created_at,
            updated_at: Utc::now(),
        };
        state.runs.insert(record.id, record.clone());
        drop(state);
        self.commit(vec![Event::RunCreated {
            run_id: record.id,
            workspace_id: record.workspace_id,
        }]);
        Ok(record)
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| RunwayError::NotFound(format!("run {id}")))
    }

    async fn workspace_queue(&self, id: WorkspaceId) -> Result<WorkspaceQueue> {
        let state = self.state.lock().await;
        let workspace = state
            .workspaces
            .get(&id)
            .cloned()
            .ok_or_else(|| RunwayError::NotFound(format!("workspace {id}")))?;
        let current = workspace
            .current_run_id
            .and_then(|run| state.runs.get(&run).cloned());
        let mut waiting: Vec<Run> = state
            .runs
            .values()
            .filter(|run| run.workspace_id == id && run.status.is_waiting())
            .cloned()
            .collect();
        waiting.sort_by_key(Run::queue_key);
        Ok(WorkspaceQueue {
            workspace,
            current,
            waiting,
        })
    }

    async fn mark_queued(&self, workspace: WorkspaceId, runs: &[RunId]) -> Result<u64> {
        self.write_guard("mark queued")?;
        let mut state = self.state.lock().await;
        let mut events = Vec::new();
        for id in runs {
            let Some(run) = state.runs.get_mut(id) else {
                continue;
            };
            if run.workspace_id != workspace || run.status != RunStatus::Pending {
                continue;
            }
            run.status = RunStatus::Queued;
            run.updated_at = Utc::now();
            events.push(Event::RunStatusChanged {
                run_id: run.id,
                workspace_id: workspace,
                status: RunStatus::Queued,
            });
        }
        drop(state);
        let moved = events.len() as u64;
        self.commit(events);
        Ok(moved)
    }

    async fn release_current(&self, workspace: WorkspaceId, expected: RunId) -> Result<bool> {
        self.write_guard("release workspace")?;
        let mut state = self.state.lock().await;
        let workspace = state.workspace_mut(workspace)?;
        if workspace.current_run_id == Some(expected) {
            workspace.current_run_id = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn promote_run(&self, workspace: WorkspaceId, run: RunId) -> Result<Promotion> {
        let mut state = self.state.lock().await;
        let pool = {
            let record = state.workspace_mut(workspace)?;
            match record.current_run_id {
                Some(current) if current == run => return Ok(Promotion::AlreadyCurrent),
                Some(current) => {
                    return Err(RunwayError::Conflict(format!(
                        "workspace {workspace} is held by run {current}"
                    )));
                }
                None => record.pool_id,
            }
        };
        let record = state.run_mut(run)?.clone();
        if record.workspace_id != workspace {
            return Err(RunwayError::InvariantViolation(format!(
                "run {run} does not belong to workspace {workspace}"
            )));
        }
        if record.status != RunStatus::Queued {
            return Err(RunwayError::Conflict(format!(
                "run {run} is {}, not queued",
                record.status
            )));
        }
        check_run_transition(&record, RunStatus::Planning)?;
        self.write_guard("promote run")?;

        let job = state.insert_job(run, Phase::Plan, pool)?;
        state.set_run_status(run, RunStatus::Planning)?;
        state.workspace_mut(workspace)?.current_run_id = Some(run);
        drop(state);

        self.commit(vec![
            Event::RunStatusChanged {
                run_id: run,
                workspace_id: workspace,
                status: RunStatus::Planning,
            },
            Event::JobRunnable {
                job_id: job.id,
                pool_id: pool,
            },
        ]);
        Ok(Promotion::Promoted(job))
    }

    async fn start_apply(&self, run: RunId) -> Result<Job> {
        self.write_guard("start apply")?;
        let mut state = self.state.lock().await;
        let record = state.run_mut(run)?.clone();
        check_run_transition(&record, RunStatus::Applying)?;
        let pool = state.pool_of_workspace(record.workspace_id)?;
        let job = state.insert_job(run, Phase::Apply, pool)?;
        state.set_run_status(run, RunStatus::Applying)?;
        drop(state);

        self.commit(vec![
            Event::RunStatusChanged {
                run_id: run,
                workspace_id: record.workspace_id,
                status: RunStatus::Applying,
            },
            Event::JobRunnable {
                job_id: job.id,
                pool_id: pool,
            },
        ]);
        Ok(job)
    }

    async fn terminate_run(&self, run: RunId, status: RunStatus) -> Result<Run> {
        if !status.is_terminal() {
            return Err(RunwayError::InvariantViolation(format!(
                "{status} is not a terminal run status"
            )));
        }
        self.write_guard("terminate run")?;
        let mut state = self.state.lock().await;
        let record = state.run_mut(run)?.clone();
        check_run_transition(&record, status)?;

        let live: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.run_id == run && !job.status.is_terminal())
            .map(|job| job.id)
            .collect();
        let mut events = Vec::new();
        for id in live {
            let job = state.job_mut(id)?;
            let held = job.status.holds_agent().then_some(job.agent_id).flatten();
            job.status = JobStatus::Canceled;
            job.version += 1;
            job.updated_at = Utc::now();
            events.push(Event::JobFinished {
                job_id: job.id,
                run_id: run,
                pool_id: job.pool_id,
                agent_id: job.agent_id,
                status: JobStatus::Canceled,
            });
            state.release_slot(held);
        }
        let updated = state.set_run_status(run, status)?;
        drop(state);

        events.insert(
            0,
            Event::RunStatusChanged {
                run_id: run,
                workspace_id: updated.workspace_id,
                status,
            },
        );
        self.commit(events);
        Ok(updated)
    }

    async fn jobs_for_run(&self, run: RunId) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.run_id == run)
            .cloned()
            .collect();
        jobs.sort_by_key(Job::queue_key);
        Ok(jobs)
    }
}

#[async_trait]
impl AgentRepository for InMemoryStore {
    async fn ensure_pool(&self, name: &str) -> Result<AgentPool> {
        let mut state = self.state.lock().await;
        if let Some(pool) = state.pools.values().find(|pool| pool.name == name) {
            return Ok(pool.clone());
        }
        let pool = AgentPool {
            id: AgentPoolId::new(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        state.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    async fn get_pool(&self, id: AgentPoolId) -> Result<AgentPool> {
        let state = self.state.lock().await;
        state
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| RunwayError::NotFound(format!("agent pool {id}")))
    }

    async fn insert_agent(&self, agent: NewAgent) -> Result<Agent> {
        self.write_guard("register agent")?;
        let mut state = self.state.lock().await;
        if !state.pools.contains_key(&agent.pool_id) {
            return Err(RunwayError::NotFound(format!("agent pool {}", agent.pool_id)));
        }
        let record = Agent {
            id: AgentId::new(),
            pool_id: agent.pool_id,
            name: agent.name,
            version: agent.version,
            status: AgentStatus::Pending,
            capacity: agent.capacity,
            load: 0,
            reported_load: 0,
            registered_at: agent.registered_at,
            last_seen_at: agent.registered_at,
        };
        state.agents.insert(record.id, record.clone());
        drop(state);
        self.commit(vec![Event::AgentRegistered {
            agent_id: record.id,
            pool_id: record.pool_id,
        }]);
        Ok(record)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        let state = self.state.lock().await;
        state
            .agents
            .get(&id)
            .cloned()
            .ok_or_else(|| RunwayError::NotFound(format!("agent {id}")))
    }

    async fn list_agents(&self, pool: Option<AgentPoolId>) -> Result<Vec<Agent>> {
        let state = self.state.lock().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|agent| !agent.status.is_retired())
            .filter(|agent| pool.is_none_or(|pool| agent.pool_id == pool))
            .cloned()
            .collect();
        agents.sort_by_key(|agent| (agent.registered_at, agent.id));
        Ok(agents)
    }

    async fn record_heartbeat(
        &self,
        id: AgentId,
        reported_load: u32,
        seen_at: DateTime<Utc>,
    ) -> Result<Agent> {
        self.write_guard("heartbeat")?;
        let mut state = self.state.lock().await;
        let agent = match state.agents.get_mut(&id) {
            Some(agent) if !agent.status.is_retired() => agent,
            _ => return Err(RunwayError::NotFound(format!("agent {id}"))),
        };
        agent.reported_load = reported_load;
        agent.last_seen_at = seen_at;
        let base = match agent.status {
            AgentStatus::Pending => AgentStatus::Idle,
            other => other,
        };
        agent.status = status_for_load(base, agent.load);
        let agent = agent.clone();
        drop(state);
        self.commit(vec![Event::AgentHeartbeat {
            agent_id: agent.id,
            pool_id: agent.pool_id,
            status: agent.status,
            load: agent.load,
        }]);
        Ok(agent)
    }

    async fn retire_agent(
        &self,
        id: AgentId,
        status: AgentStatus,
        evicted: bool,
    ) -> Result<Retirement> {
        if !status.is_retired() {
            return Err(RunwayError::InvariantViolation(format!(
                "{status} does not retire an agent"
            )));
        }
        self.write_guard("retire agent")?;
        let mut state = self.state.lock().await;
        let agent = state.agent_mut(id)?;
        if agent.status.is_retired() {
            return Ok(Retirement {
                agent: agent.clone(),
                released_jobs: Vec::new(),
            });
        }
        let retirement = state.retire(id, status)?;
        drop(state);
        self.commit(retirement.events(evicted));
        Ok(retirement)
    }

    async fn evict_agent(
        &self,
        id: AgentId,
        seen_before: DateTime<Utc>,
    ) -> Result<Option<Retirement>> {
        self.write_guard("evict agent")?;
        let mut state = self.state.lock().await;
        if !state.agent_mut(id)?.is_stale(seen_before) {
            return Ok(None);
        }
        let retirement = state.retire(id, AgentStatus::Exited)?;
        drop(state);
        self.commit(retirement.events(true));
        Ok(Some(retirement))
    }

    async fn stale_agents(&self, seen_before: DateTime<Utc>) -> Result<Vec<Agent>> {
        let state = self.state.lock().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|agent| agent.is_stale(seen_before))
            .cloned()
            .collect();
        agents.sort_by_key(|agent| (agent.last_seen_at, agent.id));
        Ok(agents)
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn get_job(&self, id: JobId) -> Result<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| RunwayError::NotFound(format!("job {id}")))
    }

    async fn unscheduled_jobs(&self) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Unscheduled)
            .cloned()
            .collect();
        jobs.sort_by_key(Job::queue_key);
        Ok(jobs)
    }

    async fn allocate_job(
        &self,
        job: JobId,
        expected_version: i64,
        agent: AgentId,
    ) -> Result<Job> {
        self.write_guard("allocate job")?;
        let mut state = self.state.lock().await;
        let record = state.job_mut(job)?.clone();
        if record.version != expected_version || record.status != JobStatus::Unscheduled {
            return Err(RunwayError::Conflict(format!(
                "job {job} changed since version {expected_version}"
            )));
        }
        let worker = state.agent_mut(agent)?;
        if worker.status.is_retired() {
            return Err(RunwayError::Conflict(format!("agent {agent} has departed")));
        }
        if worker.pool_id != record.pool_id {
            return Err(RunwayError::InvariantViolation(format!(
                "agent {agent} is not in pool {}",
                record.pool_id
            )));
        }
        if worker.load >= worker.capacity {
            return Err(RunwayError::Conflict(format!(
                "agent {agent} is at capacity {}",
                worker.capacity
            )));
        }
        worker.load += 1;
        worker.status = status_for_load(worker.status, worker.load);

        let record = state.job_mut(job)?;
        record.status = JobStatus::Allocated;
        record.agent_id = Some(agent);
        record.version += 1;
        record.updated_at = Utc::now();
        let record = record.clone();
        drop(state);

        self.commit(vec![Event::JobAllocated {
            job_id: job,
            agent_id: agent,
            pool_id: record.pool_id,
        }]);
        Ok(record)
    }

    async fn assigned_jobs(&self, agent: AgentId) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.agent_id == Some(agent) && job.status.holds_agent())
            .cloned()
            .collect();
        jobs.sort_by_key(Job::queue_key);
        Ok(jobs)
    }

    async fn start_job(&self, job: JobId, agent: AgentId) -> Result<Job> {
        self.write_guard("start job")?;
        let mut state = self.state.lock().await;
        let record = state.job_mut(job)?;
        if record.agent_id != Some(agent) || record.status != JobStatus::Allocated {
            return Err(RunwayError::Conflict(format!(
                "job {job} is not allocated to agent {agent}"
            )));
        }
        record.status = JobStatus::Running;
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn finish_job(
        &self,
        job: JobId,
        agent: AgentId,
        outcome: JobStatus,
    ) -> Result<JobCompletion> {
        if !outcome.is_terminal() {
            return Err(RunwayError::InvariantViolation(format!(
                "{outcome} is not a terminal job status"
            )));
        }
        self.write_guard("finish job")?;
        let mut state = self.state.lock().await;
        let record = state.job_mut(job)?.clone();
        if record.agent_id != Some(agent) || !record.status.holds_agent() {
            return Err(RunwayError::Conflict(format!(
                "job {job} is not assigned to agent {agent}"
            )));
        }
        check_job_transition(&record, outcome)?;
        let run = state
            .runs
            .get(&record.run_id)
            .cloned()
            .ok_or_else(|| {
                RunwayError::InvariantViolation(format!(
                    "job {job} references missing run {}",
                    record.run_id
                ))
            })?;
        let steps = run_steps_after(&run, record.phase, outcome)?;

        let finished = {
            let stored = state.job_mut(job)?;
            stored.status = outcome;
            stored.version += 1;
            stored.updated_at = Utc::now();
            stored.clone()
        };
        state.release_slot(Some(agent));

        let mut events = vec![Event::JobFinished {
            job_id: job,
            run_id: run.id,
            pool_id: finished.pool_id,
            agent_id: Some(agent),
            status: outcome,
        }];
        let mut next_job = None;
        let mut updated = run.clone();
        for step in steps {
            if step == RunStatus::Applying {
                let apply = state.insert_job(run.id, Phase::Apply, finished.pool_id)?;
                next_job = Some(apply);
            }
            updated = state.set_run_status(run.id, step)?;
            events.push(Event::RunStatusChanged {
                run_id: run.id,
                workspace_id: run.workspace_id,
                status: step,
            });
        }
        drop(state);

        if let Some(apply) = &next_job {
            events.push(Event::JobRunnable {
                job_id: apply.id,
                pool_id: apply.pool_id,
            });
        }
        self.commit(events);
        Ok(JobCompletion {
            job: finished,
            run: updated,
            next_job,
        })
    }
}

#[async_trait]
impl LogRepository for InMemoryStore {
    async fn append_log(&self, job: JobId, data: &[u8]) -> Result<u64> {
        self.write_guard("append log")?;
        let mut state = self.state.lock().await;
        if !state.jobs.contains_key(&job) {
            return Err(RunwayError::NotFound(format!("job {job}")));
        }
        let stream = state.logs.entry(job).or_default();
        if stream.closed {
            return Err(RunwayError::InvariantViolation(format!(
                "log stream for job {job} is closed"
            )));
        }
        if data.is_empty() {
            return Ok(stream.length);
        }
        stream.chunks.push((stream.length, data.to_vec()));
        stream.length += data.len() as u64;
        stream.closed = data.contains(&END_OF_STREAM);
        Ok(stream.length)
    }

    async fn read_log(&self, job: JobId, offset: u64, limit: Option<u64>) -> Result<LogSlice> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&job) {
            return Err(RunwayError::NotFound(format!("job {job}")));
        }
        let (length, closed, data) = match state.logs.get(&job) {
            Some(stream) => {
                let (from, to) = read_window(stream.length, offset, limit)?;
                let chunks = stream
                    .chunks
                    .iter()
                    .map(|(start, bytes)| (*start, bytes.as_slice()));
                (stream.length, stream.closed, stitch(chunks, from, to))
            }
            None => {
                read_window(0, offset, limit)?;
                (0, false, Vec::new())
            }
        };
        Ok(LogSlice {
            job_id: job,
            offset,
            data,
            stream_length: length,
            closed,
        })
    }

    async fn log_length(&self, job: JobId) -> Result<(u64, bool)> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&job) {
            return Err(RunwayError::NotFound(format!("job {job}")));
        }
        Ok(state
            .logs
            .get(&job)
            .map(|stream| (stream.length, stream.closed))
            .unwrap_or((0, false)))
    }
}
