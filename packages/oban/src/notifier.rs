//! Queue wakeups over Postgres LISTEN/NOTIFY.
//!
//! Inserts and staging sweeps publish the affected queue name on a single
//! channel; every node runs a [`NotificationRouter`] that forwards payloads
//! to the local producer for that queue. Notifications are a latency
//! optimization only — producers still poll on their fetch interval, so a
//! dropped notification delays a job rather than losing it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::service::Service;

/// The pg_notify channel shared by all nodes.
pub const CHANNEL: &str = "oban_insert";

/// Publishes queue wakeups.
#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
}

impl Notifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Tell every node that `queue` has new available work.
    pub async fn notify(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn connect_listener(&self) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANNEL).await?;
        Ok(listener)
    }
}

/// Listens on the channel and wakes the matching local producer for each
/// payload. Reconnects with a short delay on listener errors.
pub struct NotificationRouter {
    notifier: Notifier,
    wakers: Arc<HashMap<String, Arc<Notify>>>,
}

impl NotificationRouter {
    pub fn new(notifier: Notifier, wakers: Arc<HashMap<String, Arc<Notify>>>) -> Self {
        Self { notifier, wakers }
    }
}

#[async_trait]
impl Service for NotificationRouter {
    fn name(&self) -> &'static str {
        "notification-router"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let mut listener = match self.notifier.connect_listener().await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(error = %e, "notification listener failed to connect");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            let queue = notification.payload();
                            if let Some(waker) = self.wakers.get(queue) {
                                debug!(queue = %queue, "waking producer");
                                waker.notify_one();
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "notification listener dropped, reconnecting");
                            break;
                        }
                    }
                }
            }
        }
    }
}
