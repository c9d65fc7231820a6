use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{AgentId, AgentPoolId, JobId, RunId},
};

/// The phase of a run a job executes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Apply,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Apply => "apply",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Phase::Plan),
            "apply" => Ok(Phase::Apply),
            other => Err(ModelError::UnknownStatus {
                kind: "phase",
                value: other.to_string(),
            }),
        }
    }
}

/// Allocation-visible job states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Unscheduled,
    Allocated,
    Running,
    Finished,
    Errored,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Unscheduled,
        JobStatus::Allocated,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Errored,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unscheduled => "unscheduled",
            JobStatus::Allocated => "allocated",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Errored => "errored",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Errored | JobStatus::Canceled
        )
    }

    /// Counts against the load of the agent it references.
    pub fn holds_agent(&self) -> bool {
        matches!(self, JobStatus::Allocated | JobStatus::Running)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (*self, next) {
            (JobStatus::Unscheduled, JobStatus::Allocated) => true,
            (JobStatus::Allocated, JobStatus::Running) => true,
            // agent lost: back into the pool for reallocation
            (JobStatus::Allocated | JobStatus::Running, JobStatus::Unscheduled) => {
                true
            }
            (from, to) if !from.is_terminal() && to.is_terminal() => {
                // finished only ever comes from a running job
                to != JobStatus::Finished || from == JobStatus::Running
            }
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownStatus {
                kind: "job",
                value: s.to_string(),
            })
    }
}

/// One phase of a run, the unit dispatched to an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub phase: Phase,
    /// Only agents in this pool may execute the job.
    pub pool_id: AgentPoolId,
    pub status: JobStatus,
    /// Weak reference: cleared when the agent is evicted.
    pub agent_id: Option<AgentId>,
    /// Bumped on every write; allocation checks it optimistically.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn queue_key(&self) -> (DateTime<Utc>, JobId) {
        (self.created_at, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_path() {
        assert!(JobStatus::Unscheduled.can_transition_to(JobStatus::Allocated));
        assert!(JobStatus::Allocated.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Finished));
        assert!(!JobStatus::Unscheduled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Allocated.can_transition_to(JobStatus::Finished));
    }

    #[test]
    fn lost_agent_returns_job_to_pool() {
        assert!(JobStatus::Allocated.can_transition_to(JobStatus::Unscheduled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Unscheduled));
        assert!(!JobStatus::Finished.can_transition_to(JobStatus::Unscheduled));
    }

    #[test]
    fn failures_are_reachable_before_completion() {
        for from in [
            JobStatus::Unscheduled,
            JobStatus::Allocated,
            JobStatus::Running,
        ] {
            assert!(from.can_transition_to(JobStatus::Canceled));
            assert!(from.can_transition_to(JobStatus::Errored));
        }
        assert!(!JobStatus::Canceled.can_transition_to(JobStatus::Errored));
    }

    #[test]
    fn only_assigned_jobs_hold_agents() {
        assert!(JobStatus::Allocated.holds_agent());
        assert!(JobStatus::Running.holds_agent());
        assert!(!JobStatus::Unscheduled.holds_agent());
        assert!(!JobStatus::Finished.holds_agent());
    }
}
