use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use runway_model::LockId;

use super::{LockProvider, LockedBody};
use crate::error::{Result, RunwayError};

#[derive(Default)]
struct LockTable {
    mutexes: HashMap<LockId, Arc<tokio::sync::Mutex<()>>>,
    sessions: HashMap<LockId, CancellationToken>,
}

/// Process-local lock provider. Clones share one lock table, so several
/// supervisors built from clones behave like replicas sharing a store.
#[derive(Clone, Default)]
pub struct InMemoryLockProvider {
    table: Arc<Mutex<LockTable>>,
}

impl std::fmt::Debug for InMemoryLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = self
            .table
            .lock()
            .map(|table| table.sessions.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryLockProvider")
            .field("held", &held)
            .finish()
    }
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, lock: LockId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table.mutexes.entry(lock).or_default().clone())
    }

    fn open_session(&self, lock: LockId) -> Result<CancellationToken> {
        let session = CancellationToken::new();
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        table.sessions.insert(lock, session.clone());
        Ok(session)
    }

    fn close_session(&self, lock: LockId) {
        if let Ok(mut table) = self.table.lock() {
            table.sessions.remove(&lock);
        }
    }

    pub fn is_held(&self, lock: LockId) -> bool {
        self.table
            .lock()
            .map(|table| table.sessions.contains_key(&lock))
            .unwrap_or(false)
    }

    /// Drops the holder's session as if its store connection died.
    pub fn sever(&self, lock: LockId) -> bool {
        match self.table.lock() {
            Ok(table) => match table.sessions.get(&lock) {
                Some(session) => {
                    session.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

fn poisoned() -> RunwayError {
    RunwayError::Internal("lock table poisoned".into())
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn with_lock(
        &self,
        lock: LockId,
        cancel: CancellationToken,
        body: LockedBody,
    ) -> Result<()> {
        let mutex = self.mutex_for(lock)?;
        let _guard = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RunwayError::Cancelled(format!("waiting for lock {lock}")));
            }
            guard = mutex.lock_owned() => guard,
        };
        let session = self.open_session(lock)?;
        info!(target: "runway::supervisor", %lock, "lock acquired");

        let body_token = cancel.child_token();
        let mut work = body(body_token.clone());
        let finished = tokio::select! {
            result = &mut work => Some(result),
            _ = session.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                body_token.cancel();
                let _ = work.await;
                Err(RunwayError::TransientInfra(format!(
                    "lock {lock} session lost"
                )))
            }
        };

        self.close_session(lock);
        info!(target: "runway::supervisor", %lock, "lock released");
        result
    }
}
