//! Cross-replica mutual exclusion for exclusive subsystems.
//!
//! Production uses Postgres session advisory locks: the store is already a
//! hard dependency, so it doubles as the coordination service. Tests and
//! single-process embedders use [`InMemoryLockProvider`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use runway_model::LockId;

use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryLockProvider;
pub use postgres::PgLockProvider;

/// Work executed while a lock is held. The token it receives is cancelled
/// when the caller cancels or the lock is lost; the body must return soon
/// after.
pub type LockedBody =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Blocks until `lock` is held, runs `body`, then releases.
    ///
    /// Returns `Cancelled` if `cancel` fires before acquisition,
    /// `TransientInfra` if the lock was lost while `body` ran, and otherwise
    /// whatever `body` returned.
    async fn with_lock(
        &self,
        lock: LockId,
        cancel: CancellationToken,
        body: LockedBody,
    ) -> Result<()>;
}
