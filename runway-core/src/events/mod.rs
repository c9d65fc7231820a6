//! Change notifications for the reactive subsystems.
//!
//! Consumers subscribe to the event kinds they care about and receive
//! [`Notification`]s. A [`Notification::Resync`] means events may have been
//! missed (slow consumer, listener reconnect) and the consumer should fall
//! back to a full reconciliation.

use std::time::Duration;

use tokio::sync::watch;

use runway_model::{Event, EventKind};

pub mod bus;
pub mod listener;

pub use bus::{InProcEventBus, Subscription};
pub use listener::PgEventListener;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Event(Event),
    Resync,
}

pub trait EventStream: Send + Sync {
    /// Subscribes to the given kinds; an empty slice receives every event.
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription;

    /// Flips to `true` once the stream is live.
    fn started(&self) -> watch::Receiver<bool>;
}

/// Waits until `stream` reports itself live. Returns `false` on timeout.
pub async fn wait_started(stream: &dyn EventStream, timeout: Duration) -> bool {
    let mut started = stream.started();
    let live = started.wait_for(|live| *live);
    matches!(tokio::time::timeout(timeout, live).await, Ok(Ok(_)))
}
