use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{RunId, WorkspaceId},
    job::{JobStatus, Phase},
};

/// Run lifecycle. The happy path is linear; `errored`, `canceled` and
/// `discarded` are side exits from any non-terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Planning,
    Planned,
    Applying,
    Applied,
    Errored,
    Canceled,
    Discarded,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Pending,
        RunStatus::Queued,
        RunStatus::Planning,
        RunStatus::Planned,
        RunStatus::Applying,
        RunStatus::Applied,
        RunStatus::Errored,
        RunStatus::Canceled,
        RunStatus::Discarded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Queued => "queued",
            RunStatus::Planning => "planning",
            RunStatus::Planned => "planned",
            RunStatus::Applying => "applying",
            RunStatus::Applied => "applied",
            RunStatus::Errored => "errored",
            RunStatus::Canceled => "canceled",
            RunStatus::Discarded => "discarded",
        }
    }

    /// Terminal states are final: nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied
                | RunStatus::Errored
                | RunStatus::Canceled
                | RunStatus::Discarded
        )
    }

    /// Waiting in the workspace queue, not yet holding the workspace.
    pub fn is_waiting(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Queued)
    }

    /// Holding the workspace: at most one run per workspace may be here.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && !self.is_waiting()
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunStatus::Errored | RunStatus::Canceled | RunStatus::Discarded => true,
            RunStatus::Pending => false,
            RunStatus::Queued => *self == RunStatus::Pending,
            RunStatus::Planning => *self == RunStatus::Queued,
            RunStatus::Planned => *self == RunStatus::Planning,
            RunStatus::Applying => *self == RunStatus::Planned,
            RunStatus::Applied => *self == RunStatus::Applying,
        }
    }

    /// Status a run moves to once the job for `phase` reaches `outcome`.
    ///
    /// Returns `None` when the outcome is not terminal for the job.
    pub fn after_phase(
        phase: Phase,
        outcome: JobStatus,
        auto_apply: bool,
    ) -> Option<RunStatus> {
        match (phase, outcome) {
            (Phase::Plan, JobStatus::Finished) if auto_apply => {
                Some(RunStatus::Applying)
            }
            (Phase::Plan, JobStatus::Finished) => Some(RunStatus::Planned),
            (Phase::Apply, JobStatus::Finished) => Some(RunStatus::Applied),
            (_, JobStatus::Errored) => Some(RunStatus::Errored),
            (_, JobStatus::Canceled) => Some(RunStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownStatus {
                kind: "run",
                value: s.to_string(),
            })
    }
}

/// One plan/apply cycle for a workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
    /// Continue straight into the apply phase once planning succeeds.
    pub auto_apply: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Queue order: creation time, then id for a deterministic tie-break.
    /// Uuid ordering is bytewise, which matches lexicographic order of the
    /// hyphenated form.
    pub fn queue_key(&self) -> (DateTime<Utc>, RunId) {
        (self.created_at, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_transition() {
        for from in RunStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in RunStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn happy_path_is_linear() {
        let path = [
            RunStatus::Pending,
            RunStatus::Queued,
            RunStatus::Planning,
            RunStatus::Planned,
            RunStatus::Applying,
            RunStatus::Applied,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Planning));
        assert!(!RunStatus::Planning.can_transition_to(RunStatus::Applying));
    }

    #[test]
    fn side_exits_are_reachable_from_non_terminal_states() {
        for from in RunStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(RunStatus::Errored));
            assert!(from.can_transition_to(RunStatus::Canceled));
            assert!(from.can_transition_to(RunStatus::Discarded));
        }
        assert!(!RunStatus::Applied.can_transition_to(RunStatus::Discarded));
    }

    #[test]
    fn active_means_holding_the_workspace() {
        assert!(!RunStatus::Queued.is_active());
        assert!(RunStatus::Planning.is_active());
        assert!(RunStatus::Planned.is_active());
        assert!(!RunStatus::Applied.is_active());
    }

    #[test]
    fn phase_outcomes_advance_the_run() {
        assert_eq!(
            RunStatus::after_phase(Phase::Plan, JobStatus::Finished, false),
            Some(RunStatus::Planned)
        );
        assert_eq!(
            RunStatus::after_phase(Phase::Plan, JobStatus::Finished, true),
            Some(RunStatus::Applying)
        );
        assert_eq!(
            RunStatus::after_phase(Phase::Apply, JobStatus::Errored, false),
            Some(RunStatus::Errored)
        );
        assert_eq!(
            RunStatus::after_phase(Phase::Apply, JobStatus::Running, false),
            None
        );
    }

    #[test]
    fn statuses_parse_from_their_stored_form() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("exploded".parse::<RunStatus>().is_err());
    }
}
