//! Keeps at most one run per workspace active and promotes queued runs in
//! creation order.
//!
//! Completion is detected as "the workspace pointer is empty", never as a
//! particular terminal status, so a run discarded straight out of the queue
//! frees the workspace exactly like one that applied.

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use runway_model::{EventKind, RunId, RunStatus, SchedulerConfig, WorkspaceId, lock};

use crate::{
    error::{Result, RunwayError},
    events::{EventStream, Notification},
    persistence::{Promotion, RunRepository, WorkspaceRepository},
    supervisor::Subsystem,
};

/// What one workspace reconciliation changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkspaceOutcome {
    pub queued: u64,
    pub released: Option<RunId>,
    pub promoted: Option<RunId>,
}

impl WorkspaceOutcome {
    pub fn writes(&self) -> u64 {
        self.queued + u64::from(self.released.is_some()) + u64::from(self.promoted.is_some())
    }
}

/// Totals for a full pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub workspaces: usize,
    pub writes: u64,
    pub promoted: Vec<RunId>,
    /// Workspaces whose reconciliation failed and must be retried.
    pub failed: Vec<WorkspaceId>,
}

pub struct Scheduler<S> {
    store: Arc<S>,
    events: Arc<dyn EventStream>,
    config: SchedulerConfig,
}

impl<S> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("store", &std::any::type_name::<S>())
            .field("config", &self.config)
            .finish()
    }
}

impl<S> Scheduler<S>
where
    S: WorkspaceRepository + RunRepository + 'static,
{
    pub fn new(store: Arc<S>, events: Arc<dyn EventStream>, config: SchedulerConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Brings one workspace to a consistent state. Writes nothing when it
    /// already is.
    #[instrument(skip(self), target = "runway::scheduler")]
    pub async fn reconcile_workspace(&self, workspace: WorkspaceId) -> Result<WorkspaceOutcome> {
        let queue = self.store.workspace_queue(workspace).await?;
        let mut outcome = WorkspaceOutcome::default();

        let pending: Vec<RunId> = queue
            .waiting
            .iter()
            .filter(|run| run.status == RunStatus::Pending)
            .map(|run| run.id)
            .collect();
        if !pending.is_empty() {
            outcome.queued = self.store.mark_queued(workspace, &pending).await?;
        }

        if let Some(missing) = queue.dangling_current() {
            return Err(RunwayError::InvariantViolation(format!(
                "workspace {workspace} points at missing run {missing}"
            )));
        }

        if let Some(current) = &queue.current {
            if !current.status.is_terminal() {
                debug!(target: "runway::scheduler", run = %current.id, status = %current.status, "workspace busy");
                return Ok(outcome);
            }
            if self.store.release_current(workspace, current.id).await? {
                debug!(target: "runway::scheduler", run = %current.id, "released finished run");
                outcome.released = Some(current.id);
            }
        }

        // Waiting runs arrive oldest first; pending ones were just queued.
        let Some(next) = queue.waiting.first() else {
            return Ok(outcome);
        };
        match self.store.promote_run(workspace, next.id).await? {
            Promotion::Promoted(job) => {
                info!(target: "runway::scheduler", run = %next.id, job = %job.id, "promoted run");
                outcome.promoted = Some(next.id);
            }
            Promotion::AlreadyCurrent => {}
        }
        Ok(outcome)
    }

    /// Reconciles every workspace. Failures are collected, never fatal to
    /// the pass.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let ids = self.store.list_workspace_ids().await?;
        let mut report = ReconcileReport {
            workspaces: ids.len(),
            ..ReconcileReport::default()
        };
        for workspace in ids {
            match self.reconcile_workspace(workspace).await {
                Ok(outcome) => {
                    report.writes += outcome.writes();
                    report.promoted.extend(outcome.promoted);
                }
                Err(err) => {
                    log_failure(workspace, &err);
                    report.failed.push(workspace);
                }
            }
        }
        debug!(
            target: "runway::scheduler",
            workspaces = report.workspaces,
            writes = report.writes,
            failed = report.failed.len(),
            "full reconciliation complete"
        );
        Ok(report)
    }

    async fn full_pass(&self, retry: &mut BTreeSet<WorkspaceId>) {
        match self.reconcile_all().await {
            Ok(report) => {
                retry.clear();
                retry.extend(report.failed);
            }
            Err(err) => {
                warn!(target: "runway::scheduler", error = %err, "full reconciliation failed; retrying on next tick");
            }
        }
    }

    async fn targeted(&self, workspace: WorkspaceId, retry: &mut BTreeSet<WorkspaceId>) {
        retry.insert(workspace);
        let targets: Vec<WorkspaceId> = retry.iter().copied().collect();
        for target in targets {
            match self.reconcile_workspace(target).await {
                Ok(_) => {
                    retry.remove(&target);
                }
                Err(err) => log_failure(target, &err),
            }
        }
    }
}

fn log_failure(workspace: WorkspaceId, err: &RunwayError) {
    match err {
        RunwayError::InvariantViolation(_) => {
            error!(target: "runway::scheduler", %workspace, error = %err, "corrupt workspace state; skipping");
        }
        _ => {
            warn!(target: "runway::scheduler", %workspace, error = %err, "reconciliation failed; will retry");
        }
    }
}

#[async_trait]
impl<S> Subsystem for Scheduler<S>
where
    S: WorkspaceRepository + RunRepository + 'static,
{
    fn name(&self) -> &str {
        lock::SCHEDULER
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self
            .events
            .subscribe(&[EventKind::RunCreated, EventKind::RunStatusChanged]);
        let mut retry = BTreeSet::new();
        self.full_pass(&mut retry).await;

        let mut resync = tokio::time::interval(self.config.resync_interval());
        resync.tick().await;
        info!(target: "runway::scheduler", "scheduler running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => self.full_pass(&mut retry).await,
                notification = events.recv() => match notification {
                    Some(Notification::Event(event)) => {
                        if let Some(workspace) = event.workspace_id() {
                            self.targeted(workspace, &mut retry).await;
                        }
                    }
                    Some(Notification::Resync) => self.full_pass(&mut retry).await,
                    None => {
                        return Err(RunwayError::Internal("event stream closed".into()));
                    }
                },
            }
        }
        info!(target: "runway::scheduler", "scheduler stopped");
        Ok(())
    }
}
