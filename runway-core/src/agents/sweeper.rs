use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway_model::lock;

use super::AgentManager;
use crate::{error::Result, persistence::Store, supervisor::Subsystem};

/// Exclusive loop evicting agents that stopped heartbeating.
pub struct AgentSweeper<S> {
    manager: Arc<AgentManager<S>>,
}

impl<S> std::fmt::Debug for AgentSweeper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSweeper").finish_non_exhaustive()
    }
}

impl<S: Store> AgentSweeper<S> {
    pub fn new(manager: Arc<AgentManager<S>>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<S: Store> Subsystem for AgentSweeper<S> {
    fn name(&self) -> &str {
        lock::AGENT_MANAGER
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.manager.config().sweep_interval());
        info!(target: "runway::agents", "agent sweeper running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.manager.sweep(chrono::Utc::now()).await {
                        warn!(target: "runway::agents", error = %err, "agent sweep failed; retrying next interval");
                    }
                }
            }
        }
        info!(target: "runway::agents", "agent sweeper stopped");
        Ok(())
    }
}
