//! Forwards run transitions that people care about to a sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use runway_model::{Event, EventKind, RunId, RunStatus, WorkspaceId, lock};

use crate::{
    error::{Result, RunwayError},
    events::{EventStream, Notification},
    supervisor::Subsystem,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunNotification {
    pub run_id: RunId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: RunNotification) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, notification: RunNotification) -> Result<()> {
        info!(
            target: "runway::notifier",
            run = %notification.run_id,
            workspace = %notification.workspace_id,
            status = %notification.status,
            "run notification"
        );
        Ok(())
    }
}

/// Terminal states, plus `planned` which waits on a human.
pub fn worth_notifying(status: RunStatus) -> bool {
    status == RunStatus::Planned || status.is_terminal()
}

pub struct Notifier {
    events: Arc<dyn EventStream>,
    sink: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(events: Arc<dyn EventStream>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { events, sink }
    }

    async fn handle(&self, event: Event) {
        let Event::RunStatusChanged {
            run_id,
            workspace_id,
            status,
        } = event
        else {
            return;
        };
        if !worth_notifying(status) {
            return;
        }
        let notification = RunNotification {
            run_id,
            workspace_id,
            status,
        };
        if let Err(err) = self.sink.notify(notification).await {
            warn!(target: "runway::notifier", run = %run_id, error = %err, "notification failed");
        }
    }
}

#[async_trait]
impl Subsystem for Notifier {
    fn name(&self) -> &str {
        lock::NOTIFIER
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut events = self.events.subscribe(&[EventKind::RunStatusChanged]);
        info!(target: "runway::notifier", "notifier running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                notification = events.recv() => match notification {
                    Some(Notification::Event(event)) => self.handle(event).await,
                    Some(Notification::Resync) => {
                        debug!(target: "runway::notifier", "missed events are not replayed");
                    }
                    None => return Err(RunwayError::Internal("event stream closed".into())),
                },
            }
        }
        info!(target: "runway::notifier", "notifier stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use std::time::Duration;

    #[tokio::test]
    async fn forwards_only_attention_worthy_transitions() {
        let bus = InProcEventBus::new(16);
        let workspace = WorkspaceId::new();
        let applied = RunId::new();

        let mut sink = MockNotificationSink::new();
        sink.expect_notify()
            .withf(move |notification| {
                notification.run_id == applied && notification.status == RunStatus::Applied
            })
            .times(1)
            .returning(|_| Ok(()));

        let notifier = Arc::new(Notifier::new(Arc::new(bus.clone()), Arc::new(sink)));
        let cancel = CancellationToken::new();
        let handle = {
            let notifier = Arc::clone(&notifier);
            let cancel = cancel.clone();
            tokio::spawn(async move { notifier.run(cancel).await })
        };
        while bus.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        bus.emit(Event::RunStatusChanged {
            run_id: RunId::new(),
            workspace_id: workspace,
            status: RunStatus::Planning,
        });
        bus.emit(Event::RunStatusChanged {
            run_id: applied,
            workspace_id: workspace,
            status: RunStatus::Applied,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn planned_runs_need_attention() {
        assert!(worth_notifying(RunStatus::Planned));
        assert!(worth_notifying(RunStatus::Discarded));
        assert!(!worth_notifying(RunStatus::Applying));
    }
}
