//! Readiness gates run while `runwayd serve` comes up.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::info;

use runway_core::{
    agents::AgentManager,
    events::{EventStream, wait_started},
    persistence::Store,
};

/// Reactive subsystems are useless until change notifications flow.
pub async fn await_event_listener(events: &dyn EventStream, timeout: Duration) -> Result<()> {
    if !wait_started(events, timeout).await {
        bail!(
            "event listener did not start within {} ms",
            timeout.as_millis()
        );
    }
    info!(target: "runway::events", "event listener live");
    Ok(())
}

/// Resolves `true` once the control plane can make progress, meaning at
/// least one agent is registered.
pub async fn await_first_agent<S: Store>(
    agents: Arc<AgentManager<S>>,
    cancel: CancellationToken,
) -> Result<bool> {
    info!(target: "runway::agents", "waiting for the first agent to register");
    let ready = agents.wait_for_first_agent(&cancel).await?;
    if ready {
        info!(target: "runway::agents", "control plane ready");
    }
    Ok(ready)
}
