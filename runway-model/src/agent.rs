use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{AgentId, AgentPoolId},
};

/// Agent liveness/availability as last reported or decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Idle,
    Busy,
    Errored,
    Exited,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 5] = [
        AgentStatus::Pending,
        AgentStatus::Idle,
        AgentStatus::Busy,
        AgentStatus::Errored,
        AgentStatus::Exited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Errored => "errored",
            AgentStatus::Exited => "exited",
        }
    }

    /// Retired agents never come back; they must re-register.
    pub fn is_retired(&self) -> bool {
        matches!(self, AgentStatus::Errored | AgentStatus::Exited)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownStatus {
                kind: "agent",
                value: s.to_string(),
            })
    }
}

/// Named scoping group restricting which agents may serve which jobs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPool {
    pub id: AgentPoolId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// What an agent process announces about itself when it registers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    /// Pool to join; the default pool when absent.
    #[serde(default)]
    pub pool_id: Option<AgentPoolId>,
    /// Maximum number of concurrent jobs.
    pub capacity: u32,
    #[serde(default)]
    pub version: Option<String>,
}

/// A remote worker process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub pool_id: AgentPoolId,
    pub name: String,
    pub version: Option<String>,
    pub status: AgentStatus,
    pub capacity: u32,
    /// Jobs currently allocated to or running on this agent.
    pub load: u32,
    /// Load the agent itself last reported in a heartbeat.
    pub reported_load: u32,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Agent {
    pub fn spare_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }

    /// May receive another job right now.
    pub fn accepts_work(&self) -> bool {
        !self.status.is_retired() && self.load < self.capacity
    }

    pub fn is_stale(&self, seen_before: DateTime<Utc>) -> bool {
        !self.status.is_retired() && self.last_seen_at < seen_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(load: u32, capacity: u32, status: AgentStatus) -> Agent {
        let now = Utc::now();
        Agent {
            id: AgentId::new(),
            pool_id: AgentPoolId::new(),
            name: "agent".into(),
            version: None,
            status,
            capacity,
            load,
            reported_load: load,
            registered_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn capacity_gates_work() {
        assert!(agent(0, 2, AgentStatus::Pending).accepts_work());
        assert!(agent(1, 2, AgentStatus::Busy).accepts_work());
        assert!(!agent(2, 2, AgentStatus::Busy).accepts_work());
        assert!(!agent(0, 2, AgentStatus::Exited).accepts_work());
        assert_eq!(agent(1, 3, AgentStatus::Busy).spare_capacity(), 2);
    }

    #[test]
    fn retired_agents_are_never_stale() {
        let cutoff = Utc::now() + chrono::Duration::seconds(60);
        assert!(agent(0, 1, AgentStatus::Idle).is_stale(cutoff));
        assert!(!agent(0, 1, AgentStatus::Exited).is_stale(cutoff));
    }
}
