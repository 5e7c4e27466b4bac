//! Retention for terminal rows.

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::PrunerConfig;
use crate::error::Result;
use crate::service::Service;
use crate::store::Store;

/// Rows deleted per statement, keeping individual lock footprints small.
const PRUNE_BATCH: i64 = 1_000;

pub struct Pruner {
    store: Store,
    config: PrunerConfig,
    leader: watch::Receiver<bool>,
}

impl Pruner {
    pub fn new(store: Store, config: PrunerConfig, leader: watch::Receiver<bool>) -> Self {
        Self {
            store,
            config,
            leader,
        }
    }

    async fn prune(&self) {
        let mut deleted: i64 = 0;
        while deleted < self.config.limit {
            let batch = PRUNE_BATCH.min(self.config.limit - deleted);
            match self.store.prune_jobs(self.config.max_age, batch).await {
                Ok(0) => break,
                Ok(count) => deleted += count as i64,
                Err(e) => {
                    error!(error = %e, "prune batch failed");
                    break;
                }
            }
        }
        if deleted > 0 {
            debug!(deleted, "pruned terminal jobs");
        }
    }
}

#[async_trait]
impl Service for Pruner {
    fn name(&self) -> &'static str {
        "pruner"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut leader = self.leader.clone();
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !*leader.borrow() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = leader.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = leader.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tick.tick() => self.prune().await,
            }
        }
        Ok(())
    }
}
