//! Cluster leadership over an expiring row claim.
//!
//! Each node periodically runs the conditional upsert in
//! [`Store::claim_leadership`]; whoever the single `oban_leaders` row names
//! is the leader. Renewal happens at half the lease so a healthy leader
//! never lapses, and a crashed one is replaced within a lease. Observers
//! (the leader-gated plugins) watch the broadcast flag and stop promptly on
//! loss of leadership.

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::LeaderConfig;
use crate::error::Result;
use crate::service::Service;
use crate::store::Store;

/// Lease name; a cluster has exactly one.
const LEADER_NAME: &str = "oban";

pub struct Leadership {
    store: Store,
    node: String,
    config: LeaderConfig,
    flag: watch::Sender<bool>,
}

impl Leadership {
    pub fn new(store: Store, node: String, config: &LeaderConfig) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            store,
            node,
            config: config.clone(),
            flag,
        }
    }

    /// Handle for plugins to observe leadership changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.flag.subscribe()
    }
}

#[async_trait]
impl Service for Leadership {
    fn name(&self) -> &'static str {
        "leader"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.config.renew_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let was_leader = *self.flag.borrow();
                    let is_leader = match self
                        .store
                        .claim_leadership(LEADER_NAME, &self.node, self.config.lease)
                        .await
                    {
                        Ok(claimed) => claimed,
                        Err(e) => {
                            // Failing safe: plugins stop until the next
                            // successful renewal.
                            warn!(error = %e, "leadership claim failed");
                            false
                        }
                    };

                    if is_leader != was_leader {
                        if is_leader {
                            info!(node = %self.node, "leadership acquired");
                        } else {
                            info!(node = %self.node, "leadership lost");
                        }
                    }
                    self.flag.send_replace(is_leader);
                }
            }
        }

        if *self.flag.borrow() {
            self.flag.send_replace(false);
            if let Err(e) = self.store.resign_leadership(LEADER_NAME, &self.node).await {
                warn!(error = %e, "failed to resign leadership");
            } else {
                info!(node = %self.node, "leadership resigned");
            }
        }
        Ok(())
    }
}
