//! Scheduling core of the Runway control plane.
//!
//! Exclusive background loops (scheduler, job allocator, agent sweeper,
//! notifier) run under a [`Supervisor`](supervisor::Supervisor) that keeps
//! each of them to a single daemon replica through advisory locks. State
//! lives behind the persistence ports in [`persistence`]; Postgres in
//! production, memory in tests.

pub mod agents;
pub mod allocator;
pub mod error;
pub mod events;
pub mod lock;
pub mod logs;
pub mod notifier;
pub mod persistence;
pub mod runs;
pub mod scheduler;
pub mod supervisor;

pub use error::{Result, RunwayError};

/// Migrations for the Postgres store.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
