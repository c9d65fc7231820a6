use std::fmt;

use serde::{Deserialize, Serialize};

/// Advisory lock key shared by every replica of one exclusive subsystem.
///
/// The values are the coordination key between daemon versions, so the
/// defaults below must never change once released.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LockId(pub i64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reserved for the run-status reporter; no subsystem in this daemon takes it.
pub const REPORTER: &str = "reporter";
pub const NOTIFIER: &str = "notifier";
pub const JOB_ALLOCATOR: &str = "job-allocator";
pub const AGENT_MANAGER: &str = "agent-manager";
pub const SCHEDULER: &str = "scheduler";

/// Default lock ids per exclusive subsystem.
pub const DEFAULT_LOCK_IDS: [(&str, LockId); 5] = [
    (REPORTER, LockId(8_674_665_223_082_153_551)),
    (NOTIFIER, LockId(5_577_006_791_947_779_410)),
    (JOB_ALLOCATOR, LockId(4_037_200_794_235_010_051)),
    (AGENT_MANAGER, LockId(6_129_484_611_666_145_821)),
    (SCHEDULER, LockId(5_244_751_089_271_011_734)),
];
