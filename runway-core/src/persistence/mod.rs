//! Persistence contracts for the scheduling core.
//!
//! The store is the single source of truth. Each composite operation below is
//! one atomic unit in every implementation, and every implementation emits
//! the matching [`Event`](runway_model::Event)s only once that unit is
//! durable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use runway_model::{
    Agent, AgentId, AgentPool, AgentPoolId, AgentStatus, Event, Job, JobId, JobStatus,
    LogSlice, Phase, Run, RunId, RunStatus, Workspace, WorkspaceId,
};

use crate::error::{Result, RunwayError};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(Clone, Debug)]
pub struct NewWorkspace {
    pub name: String,
    pub pool_id: AgentPoolId,
}

#[derive(Clone, Debug)]
pub struct NewRun {
    pub workspace_id: WorkspaceId,
    pub auto_apply: bool,
    pub created_at: DateTime<Utc>,
}

impl NewRun {
    pub fn now(workspace_id: WorkspaceId, auto_apply: bool) -> Self {
        Self {
            workspace_id,
            auto_apply,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewAgent {
    pub name: String,
    pub pool_id: AgentPoolId,
    pub capacity: u32,
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Everything the scheduler needs to decide about one workspace, read in a
/// single consistent snapshot.
#[derive(Clone, Debug)]
pub struct WorkspaceQueue {
    pub workspace: Workspace,
    /// The run the workspace points at, when that run exists.
    pub current: Option<Run>,
    /// Pending and queued runs, oldest first.
    pub waiting: Vec<Run>,
}

impl WorkspaceQueue {
    /// The pointer names a run the store does not have.
    pub fn dangling_current(&self) -> Option<RunId> {
        match (self.workspace.current_run_id, &self.current) {
            (Some(id), None) => Some(id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Promotion {
    /// Run now holds the workspace; its plan job awaits allocation.
    Promoted(Job),
    /// Run already held the workspace; nothing was written.
    AlreadyCurrent,
}

/// Result of a job reaching a terminal status.
#[derive(Clone, Debug)]
pub struct JobCompletion {
    pub job: Job,
    pub run: Run,
    /// Apply job created when an auto-apply plan succeeded.
    pub next_job: Option<Job>,
}

/// Result of an agent leaving, voluntarily or not.
#[derive(Clone, Debug)]
pub struct Retirement {
    pub agent: Agent,
    /// Jobs returned to `unscheduled` because the agent held them.
    pub released_jobs: Vec<Job>,
}

impl Retirement {
    /// Departure notice followed by one runnable event per released job.
    pub(crate) fn events(&self, evicted: bool) -> Vec<Event> {
        let mut events = vec![Event::AgentDeparted {
            agent_id: self.agent.id,
            pool_id: self.agent.pool_id,
            evicted,
        }];
        events.extend(self.released_jobs.iter().map(|job| Event::JobRunnable {
            job_id: job.id,
            pool_id: job.pool_id,
        }));
        events
    }
}

#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn create_workspace(&self, workspace: NewWorkspace) -> Result<Workspace>;

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Workspace>;

    async fn list_workspace_ids(&self) -> Result<Vec<WorkspaceId>>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Inserts a `pending` run.
    async fn create_run(&self, run: NewRun) -> Result<Run>;

    async fn get_run(&self, id: RunId) -> Result<Run>;

    async fn workspace_queue(&self, id: WorkspaceId) -> Result<WorkspaceQueue>;

    /// Moves the given `pending` runs to `queued`; returns how many moved.
    async fn mark_queued(&self, workspace: WorkspaceId, runs: &[RunId]) -> Result<u64>;

    /// Clears the current-run pointer if it still names `expected`.
    async fn release_current(
        &self,
        workspace: WorkspaceId,
        expected: RunId,
    ) -> Result<bool>;

    /// Points the workspace at `run`, moves it `queued → planning` and
    /// inserts its plan job. `Conflict` if another run holds the workspace or
    /// the run is no longer queued.
    async fn promote_run(&self, workspace: WorkspaceId, run: RunId) -> Result<Promotion>;

    /// `planned → applying` and insert the apply job.
    async fn start_apply(&self, run: RunId) -> Result<Job>;

    /// Moves a run to a terminal side exit. Releases the workspace pointer
    /// and cancels the run's live jobs in the same unit.
    async fn terminate_run(&self, run: RunId, status: RunStatus) -> Result<Run>;

    async fn jobs_for_run(&self, run: RunId) -> Result<Vec<Job>>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Returns the pool with `name`, creating it on first use.
    async fn ensure_pool(&self, name: &str) -> Result<AgentPool>;

    async fn get_pool(&self, id: AgentPoolId) -> Result<AgentPool>;

    /// Inserts a `pending` agent with no load.
    async fn insert_agent(&self, agent: NewAgent) -> Result<Agent>;

    async fn get_agent(&self, id: AgentId) -> Result<Agent>;

    /// Live (non-retired) agents, optionally restricted to one pool.
    async fn list_agents(&self, pool: Option<AgentPoolId>) -> Result<Vec<Agent>>;

    /// Refreshes liveness and the agent's own view of its load. `NotFound`
    /// for unknown or retired agents.
    async fn record_heartbeat(
        &self,
        id: AgentId,
        reported_load: u32,
        seen_at: DateTime<Utc>,
    ) -> Result<Agent>;

    /// Marks the agent retired and returns its jobs to `unscheduled`,
    /// clearing their agent reference, atomically.
    async fn retire_agent(
        &self,
        id: AgentId,
        status: AgentStatus,
        evicted: bool,
    ) -> Result<Retirement>;

    /// Retires the agent as evicted only if, under the row lock, it is still
    /// live and was last seen before `seen_before`. `None` when a heartbeat
    /// or another retirement got there first.
    async fn evict_agent(
        &self,
        id: AgentId,
        seen_before: DateTime<Utc>,
    ) -> Result<Option<Retirement>>;

    /// Live agents last seen before `seen_before`.
    async fn stale_agents(&self, seen_before: DateTime<Utc>) -> Result<Vec<Agent>>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// All unscheduled jobs, oldest first.
    async fn unscheduled_jobs(&self) -> Result<Vec<Job>>;

    /// Assigns the job to the agent and increments its load. `Conflict` if
    /// the job changed since `expected_version` was read or the agent has no
    /// spare capacity.
    async fn allocate_job(
        &self,
        job: JobId,
        expected_version: i64,
        agent: AgentId,
    ) -> Result<Job>;

    /// Allocated and running jobs held by the agent.
    async fn assigned_jobs(&self, agent: AgentId) -> Result<Vec<Job>>;

    /// `allocated → running`. `Conflict` unless the agent holds the job.
    async fn start_job(&self, job: JobId, agent: AgentId) -> Result<Job>;

    /// Terminal outcome reported by the agent holding the job; releases its
    /// load and advances the run.
    async fn finish_job(
        &self,
        job: JobId,
        agent: AgentId,
        outcome: JobStatus,
    ) -> Result<JobCompletion>;
}

#[async_trait]
pub trait LogRepository: Send + Sync {
    /// Appends at the end of the phase's stream; returns the new length.
    async fn append_log(&self, job: JobId, data: &[u8]) -> Result<u64>;

    /// Reads `[offset, offset + limit)` clipped to the stream.
    async fn read_log(&self, job: JobId, offset: u64, limit: Option<u64>) -> Result<LogSlice>;

    /// Current length and whether the stream has been closed.
    async fn log_length(&self, job: JobId) -> Result<(u64, bool)>;
}

/// Everything the core needs from a backing store.
pub trait Store:
    WorkspaceRepository
    + RunRepository
    + AgentRepository
    + JobRepository
    + LogRepository
    + 'static
{
}

impl<T> Store for T where
    T: WorkspaceRepository
        + RunRepository
        + AgentRepository
        + JobRepository
        + LogRepository
        + 'static
{
}

pub(crate) fn check_run_transition(run: &Run, next: RunStatus) -> Result<()> {
    if run.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(RunwayError::InvariantViolation(format!(
            "run {} cannot move from {} to {}",
            run.id, run.status, next
        )))
    }
}

pub(crate) fn check_job_transition(job: &Job, next: JobStatus) -> Result<()> {
    if job.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(RunwayError::InvariantViolation(format!(
            "job {} cannot move from {} to {}",
            job.id, job.status, next
        )))
    }
}

/// Statuses a run steps through once its `phase` job ends with `outcome`.
///
/// A successful auto-apply plan passes through `planned` on its way to
/// `applying`. Runs already terminal (cancelled underneath the agent) stay
/// put.
pub(crate) fn run_steps_after(
    run: &Run,
    phase: Phase,
    outcome: JobStatus,
) -> Result<Vec<RunStatus>> {
    if run.status.is_terminal() {
        return Ok(Vec::new());
    }
    let Some(target) = RunStatus::after_phase(phase, outcome, run.auto_apply) else {
        return Ok(Vec::new());
    };
    let steps = if target == RunStatus::Applying {
        vec![RunStatus::Planned, RunStatus::Applying]
    } else {
        vec![target]
    };
    let mut current = run.status;
    for step in &steps {
        if !current.can_transition_to(*step) {
            return Err(RunwayError::InvariantViolation(format!(
                "{phase} job ended {outcome} but run {} is {}",
                run.id, run.status
            )));
        }
        current = *step;
    }
    Ok(steps)
}

/// Status an agent shows once its load settles at `load`.
pub(crate) fn status_for_load(current: AgentStatus, load: u32) -> AgentStatus {
    match current {
        AgentStatus::Errored | AgentStatus::Exited => current,
        _ if load > 0 => AgentStatus::Busy,
        AgentStatus::Pending => AgentStatus::Pending,
        _ => AgentStatus::Idle,
    }
}

/// Clips a read request against a stream of `length` bytes.
///
/// Reading at or past the end is out of range, except reading an empty
/// stream from its origin, which yields an empty window.
pub(crate) fn read_window(
    length: u64,
    offset: u64,
    limit: Option<u64>,
) -> Result<(u64, u64)> {
    if offset > length || (offset == length && length > 0) {
        return Err(RunwayError::OutOfRange { offset, length });
    }
    let end = match limit {
        Some(limit) if limit > 0 => offset.saturating_add(limit).min(length),
        _ => length,
    };
    Ok((offset, end))
}

/// Copies `[from, to)` out of chunks given as `(start_offset, bytes)` in
/// stream order.
pub(crate) fn stitch<'a>(
    chunks: impl IntoIterator<Item = (u64, &'a [u8])>,
    from: u64,
    to: u64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(to.saturating_sub(from) as usize);
    for (start, bytes) in chunks {
        let end = start + bytes.len() as u64;
        if end <= from || start >= to {
            continue;
        }
        let lo = from.max(start) - start;
        let hi = to.min(end) - start;
        out.extend_from_slice(&bytes[lo as usize..hi as usize]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_clips_to_stream_end() {
        assert_eq!(read_window(10, 9, Some(100)).unwrap(), (9, 10));
        assert_eq!(read_window(10, 2, None).unwrap(), (2, 10));
        assert_eq!(read_window(10, 2, Some(0)).unwrap(), (2, 10));
        assert_eq!(read_window(10, 2, Some(3)).unwrap(), (2, 5));
    }

    #[test]
    fn window_rejects_reads_at_or_past_the_end() {
        assert!(matches!(
            read_window(10, 10, Some(1)),
            Err(RunwayError::OutOfRange { offset: 10, length: 10 })
        ));
        assert!(matches!(
            read_window(10, 11, None),
            Err(RunwayError::OutOfRange { .. })
        ));
        assert_eq!(read_window(0, 0, None).unwrap(), (0, 0));
    }

    #[test]
    fn stitch_spans_chunk_boundaries() {
        let chunks: Vec<(u64, &[u8])> =
            vec![(0, b"hello "), (6, b"wide "), (11, b"world")];
        assert_eq!(stitch(chunks.clone(), 0, 16), b"hello wide world");
        assert_eq!(stitch(chunks.clone(), 4, 8), b"o wi");
        assert_eq!(stitch(chunks, 15, 16), b"d");
    }

    fn run(status: RunStatus, auto_apply: bool) -> Run {
        let now = Utc::now();
        Run {
            id: RunId::new(),
            workspace_id: WorkspaceId::new(),
            status,
            auto_apply,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn auto_apply_plan_steps_through_planned() {
        let steps = run_steps_after(
            &run(RunStatus::Planning, true),
            Phase::Plan,
            JobStatus::Finished,
        )
        .unwrap();
        assert_eq!(steps, vec![RunStatus::Planned, RunStatus::Applying]);

        let steps = run_steps_after(
            &run(RunStatus::Applying, false),
            Phase::Apply,
            JobStatus::Errored,
        )
        .unwrap();
        assert_eq!(steps, vec![RunStatus::Errored]);
    }

    #[test]
    fn terminal_runs_do_not_advance() {
        let steps = run_steps_after(
            &run(RunStatus::Canceled, false),
            Phase::Plan,
            JobStatus::Finished,
        )
        .unwrap();
        assert!(steps.is_empty());
        assert!(
            run_steps_after(&run(RunStatus::Queued, false), Phase::Apply, JobStatus::Finished)
                .is_err()
        );
    }

    #[test]
    fn load_drives_agent_status() {
        assert_eq!(status_for_load(AgentStatus::Idle, 1), AgentStatus::Busy);
        assert_eq!(status_for_load(AgentStatus::Busy, 0), AgentStatus::Idle);
        assert_eq!(status_for_load(AgentStatus::Pending, 0), AgentStatus::Pending);
        assert_eq!(status_for_load(AgentStatus::Exited, 3), AgentStatus::Exited);
    }
}
