//! Supervised services.
//!
//! Every long-running component — notification router, leadership loop,
//! leader plugins, producers — implements [`Service`]. The engine runs them
//! under a [`ServiceHost`], which owns their tasks, joins them on shutdown,
//! and surfaces panics so the process can exit instead of limping on with a
//! dead component.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A long-running engine component.
#[async_trait]
pub(crate) trait Service: Send {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` is cancelled, then drain and return.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// How a supervised service left the host.
pub(crate) enum ServiceExit {
    Clean {
        name: &'static str,
        result: Result<()>,
    },
    Panicked(String),
    Aborted,
}

/// Owns the task of every spawned service.
#[derive(Default)]
pub(crate) struct ServiceHost {
    services: JoinSet<(&'static str, Result<()>)>,
}

impl ServiceHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn spawn(&mut self, service: Box<dyn Service>, shutdown: CancellationToken) {
        let name = service.name();
        self.services.spawn(async move {
            let result = service.run(shutdown).await;
            (name, result)
        });
    }

    pub(crate) async fn join_next(&mut self) -> Option<ServiceExit> {
        match self.services.join_next().await {
            None => None,
            Some(Ok((name, result))) => Some(ServiceExit::Clean { name, result }),
            Some(Err(e)) if e.is_panic() => Some(ServiceExit::Panicked(e.to_string())),
            Some(Err(_)) => Some(ServiceExit::Aborted),
        }
    }

    /// Wait for every service to finish.
    pub(crate) async fn drain(&mut self) {
        while self.services.join_next().await.is_some() {}
    }

    pub(crate) fn abort_all(&mut self) {
        self.services.abort_all();
    }
}
