use tokio::sync::{
    broadcast::{self, error::RecvError, error::TryRecvError},
    watch,
};
use tracing::warn;

use runway_model::{Event, EventKind};

use super::{EventStream, Notification};

/// In-process fan-out of store events.
///
/// The in-memory store publishes straight into it; the Postgres listener
/// feeds it from `LISTEN`. Cloning shares the channel.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<Notification>,
    started: watch::Sender<bool>,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("started", &*self.started.borrow())
            .finish()
    }
}

impl InProcEventBus {
    /// A bus that is live immediately.
    pub fn new(capacity: usize) -> Self {
        Self::with_started(capacity, true)
    }

    pub fn with_started(capacity: usize, started: bool) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (started, _) = watch::channel(started);
        Self { sender, started }
    }

    pub fn emit(&self, event: Event) {
        // No subscribers is fine; consumers resync on start.
        let _ = self.sender.send(Notification::Event(event));
    }

    /// Tells every subscriber to fall back to a full reconciliation.
    pub fn resync(&self) {
        let _ = self.sender.send(Notification::Resync);
    }

    pub fn mark_started(&self, live: bool) {
        self.started.send_replace(live);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventStream for InProcEventBus {
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds: kinds.to_vec(),
        }
    }

    fn started(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }
}

/// A filtered view of the bus.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Notification>,
    kinds: Vec<EventKind>,
}

impl Subscription {
    fn wants(&self, notification: &Notification) -> bool {
        match notification {
            Notification::Resync => true,
            Notification::Event(event) => {
                self.kinds.is_empty() || self.kinds.contains(&event.kind())
            }
        }
    }

    /// Next matching notification; `None` once the bus is gone.
    ///
    /// Falling behind the channel yields [`Notification::Resync`] instead of
    /// the dropped events.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) if self.wants(&notification) => {
                    return Some(notification);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "runway::events",
                        skipped,
                        "subscriber lagged; requesting resync"
                    );
                    return Some(Notification::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Matching notification already buffered, without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) if self.wants(&notification) => {
                    return Some(notification);
                }
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => {
                    return Some(Notification::Resync);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::wait_started;
    use runway_model::{AgentId, AgentPoolId, JobId, RunId, WorkspaceId};
    use std::time::Duration;

    fn runnable() -> Event {
        Event::JobRunnable {
            job_id: JobId::new(),
            pool_id: AgentPoolId::new(),
        }
    }

    #[tokio::test]
    async fn subscriptions_filter_by_kind() {
        let bus = InProcEventBus::new(16);
        let mut runs = bus.subscribe(&[EventKind::RunCreated]);
        let mut all = bus.subscribe(&[]);

        bus.emit(runnable());
        let created = Event::RunCreated {
            run_id: RunId::new(),
            workspace_id: WorkspaceId::new(),
        };
        bus.emit(created.clone());

        assert_eq!(runs.recv().await, Some(Notification::Event(created)));
        assert!(matches!(
            all.recv().await,
            Some(Notification::Event(Event::JobRunnable { .. }))
        ));
        assert!(runs.try_recv().is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_is_told_to_resync() {
        let bus = InProcEventBus::new(2);
        let mut sub = bus.subscribe(&[]);
        for _ in 0..5 {
            bus.emit(runnable());
        }
        assert_eq!(sub.recv().await, Some(Notification::Resync));
    }

    #[tokio::test]
    async fn resync_reaches_filtered_subscribers() {
        let bus = InProcEventBus::new(4);
        let mut sub = bus.subscribe(&[EventKind::AgentDeparted]);
        bus.emit(Event::AgentRegistered {
            agent_id: AgentId::new(),
            pool_id: AgentPoolId::new(),
        });
        bus.resync();
        assert_eq!(sub.recv().await, Some(Notification::Resync));
    }

    #[tokio::test]
    async fn started_signal_flips() {
        let bus = InProcEventBus::with_started(4, false);
        assert!(!wait_started(&bus, Duration::from_millis(5)).await);
        bus.mark_started(true);
        assert!(wait_started(&bus, Duration::from_millis(5)).await);
    }
}
