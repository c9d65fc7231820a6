use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::{PgPool, postgres::PgListener};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use runway_model::{Event, EventConfig, EventKind, SupervisorConfig};

use super::{EventStream, InProcEventBus, Subscription};
use crate::{
    error::{Result, RunwayError},
    supervisor::Subsystem,
};

/// Bridges Postgres `LISTEN` onto an [`InProcEventBus`].
///
/// Runs as a non-exclusive subsystem on every replica. Reports started once
/// the first `LISTEN` succeeds; a dropped connection is re-established with
/// backoff and surfaces to subscribers as a resync.
pub struct PgEventListener {
    pool: PgPool,
    channel: String,
    bus: InProcEventBus,
    backoff: SupervisorConfig,
}

impl std::fmt::Debug for PgEventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgEventListener")
            .field("channel", &self.channel)
            .field("bus", &self.bus)
            .finish()
    }
}

impl PgEventListener {
    pub fn new(
        pool: PgPool,
        events: &EventConfig,
        backoff: SupervisorConfig,
    ) -> Self {
        Self {
            pool,
            channel: events.channel.clone(),
            bus: InProcEventBus::with_started(events.buffer, false),
            backoff,
        }
    }

    pub fn bus(&self) -> &InProcEventBus {
        &self.bus
    }

    async fn connect(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|err| RunwayError::store("listen connect", err))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|err| RunwayError::store("listen", err))?;
        Ok(listener)
    }

    fn dispatch(&self, payload: &str) {
        match serde_json::from_str::<Event>(payload) {
            Ok(event) => {
                debug!(target: "runway::events", kind = ?event.kind(), "event received");
                self.bus.emit(event);
            }
            Err(err) => {
                warn!(target: "runway::events", error = %err, "dropping malformed event payload");
            }
        }
    }

    /// Receives until cancelled or the listener fails.
    async fn pump(
        &self,
        listener: &mut PgListener,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = listener.try_recv() => match received {
                    Ok(Some(notification)) => self.dispatch(notification.payload()),
                    Ok(None) => {
                        warn!(target: "runway::events", "listener connection lost; reconnecting");
                        self.bus.resync();
                    }
                    Err(err) => return Err(RunwayError::store("listen receive", err)),
                }
            }
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .backoff_delay(attempt, rand::rng().random_range(0.0..=1.0))
    }
}

#[async_trait]
impl Subsystem for PgEventListener {
    fn name(&self) -> &str {
        "event-listener"
    }

    fn exclusive(&self) -> bool {
        false
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut attempt = 0u32;
        while !cancel.is_cancelled() {
            let outcome = match self.connect().await {
                Ok(mut listener) => {
                    if attempt > 0 {
                        self.bus.resync();
                    }
                    attempt = 0;
                    info!(target: "runway::events", channel = %self.channel, "listening for events");
                    self.bus.mark_started(true);
                    self.pump(&mut listener, &cancel).await
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => break,
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.delay(attempt);
                    warn!(
                        target: "runway::events",
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "event listener failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(target: "runway::events", "event listener stopped");
        Ok(())
    }
}

impl EventStream for PgEventListener {
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }

    fn started(&self) -> watch::Receiver<bool> {
        self.bus.started()
    }
}
