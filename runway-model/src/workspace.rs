use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentPoolId, RunId, WorkspaceId};

/// Owns an ordered queue of runs; at most one of them is current.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    /// Pool whose agents execute this workspace's jobs.
    pub pool_id: AgentPoolId,
    /// The run holding the workspace, if any.
    pub current_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
}
