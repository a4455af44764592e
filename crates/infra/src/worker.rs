use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Handle to control and join a background loop.
///
/// `S` is the loop's runtime counters, readable while it runs.
#[derive(Debug)]
pub struct WorkerHandle<S> {
    name: &'static str,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<S>>,
}

impl<S: Clone> WorkerHandle<S> {
    pub(crate) fn new(
        name: &'static str,
        shutdown: CancellationToken,
        join: JoinHandle<()>,
        stats: Arc<Mutex<S>>,
    ) -> Self {
        Self {
            name,
            shutdown,
            join,
            stats,
        }
    }

    /// Snapshot of the loop's counters.
    pub fn stats(&self) -> S {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown and wait for the loop to stop. Returns the
    /// final counters.
    pub async fn shutdown(self) -> S {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the loop to stop without signalling it. Used when the token is
    /// shared and cancelled elsewhere.
    pub async fn join(self) -> S {
        if let Err(err) = self.join.await {
            warn!(worker = self.name, error = %err, "worker task ended abnormally");
        }
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
