//! Orphan rescue.
//!
//! An `executing` row whose producer heartbeat is gone or stale belongs to a
//! crashed or partitioned node. Rescue returns it to `available` without
//! touching `attempt`, preserving the retry budget; rows that had already
//! spent their budget are discarded instead of looping forever.

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::LifelineConfig;
use crate::error::Result;
use crate::service::Service;
use crate::store::Store;

pub struct Lifeline {
    store: Store,
    config: LifelineConfig,
    leader: watch::Receiver<bool>,
}

impl Lifeline {
    pub fn new(store: Store, config: LifelineConfig, leader: watch::Receiver<bool>) -> Self {
        Self {
            store,
            config,
            leader,
        }
    }

    async fn rescue(&self) {
        match self.store.rescue_orphans(self.config.interval).await {
            Ok(0) => {}
            Ok(rescued) => info!(rescued, "rescued orphaned jobs"),
            Err(e) => error!(error = %e, "orphan rescue failed"),
        }
    }
}

#[async_trait]
impl Service for Lifeline {
    fn name(&self) -> &'static str {
        "lifeline"
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
                _ = tick.tick() => self.rescue().await,
            }
        }
        Ok(())
    }
}
