use serde::{Deserialize, Serialize};

use crate::{
    agent::AgentStatus,
    ids::{AgentId, AgentPoolId, JobId, RunId, WorkspaceId},
    job::JobStatus,
    run::RunStatus,
};

/// Change notifications emitted by the store and consumed by the reactive
/// subsystems. Events are hints: consumers always re-read state from the
/// store before acting on one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    RunCreated {
        run_id: RunId,
        workspace_id: WorkspaceId,
    },
    RunStatusChanged {
        run_id: RunId,
        workspace_id: WorkspaceId,
        status: RunStatus,
    },
    JobRunnable {
        job_id: JobId,
        pool_id: AgentPoolId,
    },
    JobAllocated {
        job_id: JobId,
        agent_id: AgentId,
        pool_id: AgentPoolId,
    },
    JobFinished {
        job_id: JobId,
        run_id: RunId,
        pool_id: AgentPoolId,
        agent_id: Option<AgentId>,
        status: JobStatus,
    },
    AgentRegistered {
        agent_id: AgentId,
        pool_id: AgentPoolId,
    },
    AgentHeartbeat {
        agent_id: AgentId,
        pool_id: AgentPoolId,
        status: AgentStatus,
        load: u32,
    },
    AgentDeparted {
        agent_id: AgentId,
        pool_id: AgentPoolId,
        evicted: bool,
    },
}

/// Discriminant used to subscribe to a subset of events.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated,
    RunStatusChanged,
    JobRunnable,
    JobAllocated,
    JobFinished,
    AgentRegistered,
    AgentHeartbeat,
    AgentDeparted,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RunCreated { .. } => EventKind::RunCreated,
            Event::RunStatusChanged { .. } => EventKind::RunStatusChanged,
            Event::JobRunnable { .. } => EventKind::JobRunnable,
            Event::JobAllocated { .. } => EventKind::JobAllocated,
            Event::JobFinished { .. } => EventKind::JobFinished,
            Event::AgentRegistered { .. } => EventKind::AgentRegistered,
            Event::AgentHeartbeat { .. } => EventKind::AgentHeartbeat,
            Event::AgentDeparted { .. } => EventKind::AgentDeparted,
        }
    }

    pub fn workspace_id(&self) -> Option<WorkspaceId> {
        match self {
            Event::RunCreated { workspace_id, .. }
            | Event::RunStatusChanged { workspace_id, .. } => {
                Some(*workspace_id)
            }
            _ => None,
        }
    }

    pub fn pool_id(&self) -> Option<AgentPoolId> {
        match self {
            Event::JobRunnable { pool_id, .. }
            | Event::JobAllocated { pool_id, .. }
            | Event::JobFinished { pool_id, .. }
            | Event::AgentRegistered { pool_id, .. }
            | Event::AgentHeartbeat { pool_id, .. }
            | Event::AgentDeparted { pool_id, .. } => Some(*pool_id),
            _ => None,
        }
    }
}
