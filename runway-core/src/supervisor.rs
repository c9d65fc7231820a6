//! Runs subsystems, and keeps exclusive ones to one replica at a time.
//!
//! An exclusive subsystem loops: contend for its advisory lock, run while
//! holding it, release, back off, contend again. Errors and panics from a
//! subsystem become a retry; they never reach other subsystems or the
//! daemon.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use runway_model::{LockConfig, LockId, SupervisorConfig};

use crate::{
    error::{Result, RunwayError},
    lock::{LockProvider, LockedBody},
};

#[async_trait]
pub trait Subsystem: Send + Sync + 'static {
    /// Also the key into the lock-id table.
    fn name(&self) -> &str;

    fn exclusive(&self) -> bool {
        true
    }

    /// Runs until `cancel` fires. Returning early is treated as a crash.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

pub struct Supervisor {
    locks: Arc<dyn LockProvider>,
    lock_ids: LockConfig,
    config: SupervisorConfig,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("lock_ids", &self.lock_ids)
            .field("config", &self.config)
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        locks: Arc<dyn LockProvider>,
        lock_ids: LockConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            locks,
            lock_ids,
            config,
        }
    }

    /// Checks that every exclusive subsystem has a distinct lock id.
    pub fn validate(&self, subsystems: &[Arc<dyn Subsystem>]) -> Result<()> {
        let required: Vec<&str> = subsystems
            .iter()
            .filter(|subsystem| subsystem.exclusive())
            .map(|subsystem| subsystem.name())
            .collect();
        self.lock_ids.validate(&required).map_err(|err| {
            RunwayError::InvariantViolation(err.to_string())
        })
    }

    /// Spawns the subsystem's supervision loop.
    ///
    /// Fails only when an exclusive subsystem has no configured lock id.
    pub fn start(
        &self,
        cancel: CancellationToken,
        subsystem: Arc<dyn Subsystem>,
    ) -> Result<JoinHandle<()>> {
        if !subsystem.exclusive() {
            let name = subsystem.name().to_string();
            return Ok(tokio::spawn(async move {
                info!(target: "runway::supervisor", subsystem = %name, "starting");
                if let Err(err) = run_guarded(subsystem, cancel).await {
                    error!(target: "runway::supervisor", subsystem = %name, error = %err, "subsystem exited with error");
                }
                info!(target: "runway::supervisor", subsystem = %name, "stopped");
            }));
        }

        let lock = self.lock_ids.lock_id(subsystem.name()).ok_or_else(|| {
            RunwayError::InvariantViolation(format!(
                "no lock id configured for subsystem {}",
                subsystem.name()
            ))
        })?;
        let exclusive = ExclusiveLoop {
            locks: Arc::clone(&self.locks),
            lock,
            config: self.config.clone(),
            subsystem,
        };
        Ok(tokio::spawn(exclusive.run(cancel)))
    }
}

struct ExclusiveLoop {
    locks: Arc<dyn LockProvider>,
    lock: LockId,
    config: SupervisorConfig,
    subsystem: Arc<dyn Subsystem>,
}

impl ExclusiveLoop {
    async fn run(self, cancel: CancellationToken) {
        let name = self.subsystem.name().to_string();
        let lock = self.lock;
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            info!(target: "runway::supervisor", subsystem = %name, %lock, "contending for lock");
            let subsystem = Arc::clone(&self.subsystem);
            let body: LockedBody = Box::new(move |token| {
                Box::pin(async move {
                    info!(target: "runway::supervisor", subsystem = %subsystem.name(), "running under lock");
                    run_guarded(subsystem, token).await
                })
            });

            let started = Instant::now();
            let outcome = self.locks.with_lock(lock, cancel.clone(), body).await;
            if cancel.is_cancelled() {
                if let Err(err) = outcome
                    && !matches!(err, RunwayError::Cancelled(_))
                {
                    warn!(target: "runway::supervisor", subsystem = %name, error = %err, "subsystem failed during shutdown");
                }
                break;
            }

            // A long healthy run resets the backoff ladder.
            if started.elapsed().as_millis() as u64 > self.config.backoff_max_ms {
                failures = 0;
            }
            failures = failures.saturating_add(1);
            match outcome {
                Ok(()) => warn!(
                    target: "runway::supervisor",
                    subsystem = %name,
                    "subsystem returned while holding its lock; restarting"
                ),
                Err(err) if err.is_retryable() => warn!(
                    target: "runway::supervisor",
                    subsystem = %name,
                    error = %err,
                    attempt = failures,
                    "subsystem interrupted; retrying"
                ),
                Err(err) => error!(
                    target: "runway::supervisor",
                    subsystem = %name,
                    error = %err,
                    attempt = failures,
                    "subsystem crashed; restarting"
                ),
            }

            let delay = self
                .config
                .backoff_delay(failures, rand::rng().random_range(0.0..=1.0));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(target: "runway::supervisor", subsystem = %name, "stopped");
    }
}

/// Runs the subsystem on its own task so a panic becomes an error.
async fn run_guarded(
    subsystem: Arc<dyn Subsystem>,
    cancel: CancellationToken,
) -> Result<()> {
    let name = subsystem.name().to_string();
    match tokio::spawn(async move { subsystem.run(cancel).await }).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => {
            Err(RunwayError::Internal(format!("subsystem {name} panicked")))
        }
        Err(join) => Err(RunwayError::Internal(format!(
            "subsystem {name} task aborted: {join}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockProvider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Flaky {
        runs: AtomicU32,
        panic_first: bool,
    }

    #[async_trait]
    impl Subsystem for Flaky {
        fn name(&self) -> &str {
            "scheduler"
        }

        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run == 0 {
                if self.panic_first {
                    panic!("boom");
                }
                return Err(RunwayError::TransientInfra("store down".into()));
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(
            Arc::new(InMemoryLockProvider::new()),
            LockConfig::default(),
            SupervisorConfig {
                backoff_base_ms: 1,
                backoff_max_ms: 5,
                jitter_ratio: 0.0,
                lock_probe_interval_ms: 10,
            },
        )
    }

    async fn restarts_after_first_run(panic_first: bool) {
        let flaky = Arc::new(Flaky {
            runs: AtomicU32::new(0),
            panic_first,
        });
        let cancel = CancellationToken::new();
        let handle = supervisor()
            .start(cancel.clone(), flaky.clone())
            .expect("lock configured");

        for _ in 0..100 {
            if flaky.runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(flaky.runs.load(Ordering::SeqCst), 2);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor stops promptly")
            .expect("supervisor task did not panic");
    }

    #[tokio::test]
    async fn error_is_retried() {
        restarts_after_first_run(false).await;
    }

    #[tokio::test]
    async fn panic_is_contained_and_retried() {
        restarts_after_first_run(true).await;
    }

    #[tokio::test]
    async fn exclusive_subsystem_without_lock_is_rejected() {
        struct Unnamed;
        #[async_trait]
        impl Subsystem for Unnamed {
            fn name(&self) -> &str {
                "unlisted"
            }
            async fn run(&self, _cancel: CancellationToken) -> Result<()> {
                Ok(())
            }
        }
        let supervisor = supervisor();
        let subsystem: Arc<dyn Subsystem> = Arc::new(Unnamed);
        assert!(supervisor.validate(&[subsystem.clone()]).is_err());
        assert!(
            supervisor
                .start(CancellationToken::new(), subsystem)
                .is_err()
        );
    }
}
