//! Write surface for workspaces and runs, as used by the API layer.

use std::{fmt, sync::Arc};

use tracing::{info, instrument};

use runway_model::{
    AgentId, AgentPoolId, Job, JobId, JobStatus, Run, RunId, RunStatus, Workspace,
    WorkspaceId,
};

use crate::{
    error::{Result, RunwayError},
    persistence::{NewRun, NewWorkspace, Store},
};

/// Where a run stands, phrased for people.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunProgress {
    /// In the workspace queue behind another run.
    Waiting { status: RunStatus },
    /// Its job is runnable but no live agent in the pool has room.
    NoCapacity { job: JobId, pool: AgentPoolId },
    /// Its job is runnable and capacity exists; allocation is imminent.
    Scheduling { job: JobId },
    Executing {
        job: JobId,
        agent: AgentId,
        status: JobStatus,
    },
    AwaitingApply,
    Finished { status: RunStatus },
}

impl fmt::Display for RunProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunProgress::Waiting { status } => write!(f, "{status}, waiting for workspace"),
            RunProgress::NoCapacity { .. } => f.write_str("queued, no capacity"),
            RunProgress::Scheduling { .. } => f.write_str("queued, awaiting agent"),
            RunProgress::Executing { agent, status, .. } => {
                write!(f, "{status} on agent {agent}")
            }
            RunProgress::AwaitingApply => f.write_str("planned, awaiting apply"),
            RunProgress::Finished { status } => write!(f, "{status}"),
        }
    }
}

pub struct RunService<S> {
    store: Arc<S>,
    default_pool: String,
}

impl<S> fmt::Debug for RunService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunService")
            .field("store", &std::any::type_name::<S>())
            .field("default_pool", &self.default_pool)
            .finish()
    }
}

impl<S: Store> RunService<S> {
    pub fn new(store: Arc<S>, default_pool: impl Into<String>) -> Self {
        Self {
            store,
            default_pool: default_pool.into(),
        }
    }

    pub async fn create_workspace(
        &self,
        name: &str,
        pool: Option<AgentPoolId>,
    ) -> Result<Workspace> {
        let pool_id = match pool {
            Some(pool) => self.store.get_pool(pool).await?.id,
            None => self.store.ensure_pool(&self.default_pool).await?.id,
        };
        self.store
            .create_workspace(NewWorkspace {
                name: name.to_string(),
                pool_id,
            })
            .await
    }

    #[instrument(skip(self), target = "runway::scheduler")]
    pub async fn create_run(&self, workspace: WorkspaceId, auto_apply: bool) -> Result<Run> {
        let run = self.store.create_run(NewRun::now(workspace, auto_apply)).await?;
        info!(target: "runway::scheduler", run = %run.id, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, run: RunId) -> Result<Run> {
        self.store.get_run(run).await
    }

    /// Confirms a planned run; its apply job becomes runnable.
    pub async fn apply(&self, run: RunId) -> Result<Job> {
        self.store.start_apply(run).await
    }

    pub async fn discard(&self, run: RunId) -> Result<Run> {
        self.store.terminate_run(run, RunStatus::Discarded).await
    }

    pub async fn cancel(&self, run: RunId) -> Result<Run> {
        self.store.terminate_run(run, RunStatus::Canceled).await
    }

    pub async fn progress(&self, run: RunId) -> Result<RunProgress> {
        let run = self.store.get_run(run).await?;
        if run.status.is_terminal() {
            return Ok(RunProgress::Finished { status: run.status });
        }
        if run.status.is_waiting() {
            return Ok(RunProgress::Waiting { status: run.status });
        }
        if run.status == RunStatus::Planned {
            return Ok(RunProgress::AwaitingApply);
        }

        let jobs = self.store.jobs_for_run(run.id).await?;
        let Some(job) = jobs.iter().rev().find(|job| !job.status.is_terminal()) else {
            return Err(RunwayError::InvariantViolation(format!(
                "run {} is {} without a live job",
                run.id, run.status
            )));
        };
        match (job.status, job.agent_id) {
            (JobStatus::Unscheduled, _) => {
                let has_room = self
                    .store
                    .list_agents(Some(job.pool_id))
                    .await?
                    .iter()
                    .any(|agent| agent.accepts_work());
                Ok(if has_room {
                    RunProgress::Scheduling { job: job.id }
                } else {
                    RunProgress::NoCapacity {
                        job: job.id,
                        pool: job.pool_id,
                    }
                })
            }
            (status, Some(agent)) => Ok(RunProgress::Executing {
                job: job.id,
                agent,
                status,
            }),
            (status, None) => Err(RunwayError::InvariantViolation(format!(
                "job {} is {status} without an agent",
                job.id
            ))),
        }
    }
}
