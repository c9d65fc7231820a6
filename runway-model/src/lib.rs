//! Core data model definitions shared across Runway crates.
//!
//! Nothing in here talks to a store or spawns tasks: these are the records,
//! lifecycle rules, event vocabulary and configuration knobs that the
//! scheduling core and the daemon agree on.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod lock;
pub mod log;
pub mod run;
pub mod workspace;

pub use agent::{Agent, AgentPool, AgentRegistration, AgentStatus};
pub use config::{
    AgentConfig, AllocatorConfig, DaemonConfig, EventConfig, LockConfig,
    LogConfig, SchedulerConfig, StartupConfig, SupervisorConfig,
};
pub use error::{ModelError, Result as ModelResult};
pub use events::{Event, EventKind};
pub use ids::{AgentId, AgentPoolId, JobId, RunId, WorkspaceId};
pub use job::{Job, JobStatus, Phase};
pub use lock::{DEFAULT_LOCK_IDS, LockId};
pub use log::{END_OF_STREAM, LogSlice};
pub use run::{Run, RunStatus};
pub use workspace::Workspace;
