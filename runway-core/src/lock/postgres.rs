use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Connection, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_model::LockId;

use super::{LockProvider, LockedBody};
use crate::error::{Result, RunwayError};

/// Session-scoped `pg_advisory_lock` on a connection detached from the pool.
///
/// The connection is never returned to the pool while it may hold a lock:
/// closing it is the release path of last resort, since Postgres drops a
/// session's advisory locks when the session ends.
#[derive(Clone)]
pub struct PgLockProvider {
    pool: PgPool,
    probe_interval: Duration,
}

impl std::fmt::Debug for PgLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLockProvider")
            .field("pool_size", &self.pool.size())
            .field("probe_interval", &self.probe_interval)
            .finish()
    }
}

impl PgLockProvider {
    pub fn new(pool: PgPool, probe_interval: Duration) -> Self {
        Self {
            pool,
            probe_interval,
        }
    }
}

#[async_trait]
impl LockProvider for PgLockProvider {
    async fn with_lock(
        &self,
        lock: LockId,
        cancel: CancellationToken,
        body: LockedBody,
    ) -> Result<()> {
        let pooled = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RunwayError::Cancelled(format!("waiting for lock {lock}")));
            }
            conn = self.pool.acquire() => {
                conn.map_err(|err| RunwayError::store("lock connection", err))?
            }
        };
        let mut conn = pooled.detach();

        let acquire = async {
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(lock.0)
                .execute(&mut conn)
                .await
        };
        let acquired = tokio::select! {
            _ = cancel.cancelled() => None,
            result = acquire => Some(result),
        };
        match acquired {
            // Dropping the connection aborts the pending lock request.
            None => {
                drop(conn);
                return Err(RunwayError::Cancelled(format!("waiting for lock {lock}")));
            }
            Some(Err(err)) => return Err(RunwayError::store("pg_advisory_lock", err)),
            Some(Ok(_)) => {}
        }
        info!(target: "runway::supervisor", %lock, "advisory lock acquired");

        let body_token = cancel.child_token();
        let mut work = body(body_token.clone());
        let mut probe = tokio::time::interval(self.probe_interval);
        probe.tick().await;

        let finished = loop {
            tokio::select! {
                result = &mut work => break Some(result),
                _ = probe.tick() => {
                    if let Err(err) = sqlx::query("SELECT 1").execute(&mut conn).await {
                        warn!(target: "runway::supervisor", %lock, error = %err, "lock session probe failed");
                        break None;
                    }
                }
            }
        };

        let Some(result) = finished else {
            body_token.cancel();
            let _ = work.await;
            drop(conn);
            return Err(RunwayError::TransientInfra(format!(
                "advisory lock {lock} session lost"
            )));
        };

        if let Err(err) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock.0)
            .execute(&mut conn)
            .await
        {
            warn!(target: "runway::supervisor", %lock, error = %err, "explicit unlock failed; closing session");
        }
        if let Err(err) = conn.close().await {
            warn!(target: "runway::supervisor", %lock, error = %err, "closing lock session failed");
        }
        info!(target: "runway::supervisor", %lock, "advisory lock released");
        result
    }
}
