//! Background eviction of idle sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_core::PipelineLike;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::SessionStore;

/// How long a session may sit unused before it is reclaimed.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(3600);

/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Periodically evicts sessions idle past the threshold and releases
/// their pipelines. One reaper runs per process, spawned and joined by
/// the composition root.
pub struct Reaper<P> {
    store: Arc<SessionStore<P>>,
    interval: Duration,
    threshold: Duration,
}

impl<P: PipelineLike + 'static> Reaper<P> {
    pub fn new(store: Arc<SessionStore<P>>, interval: Duration, threshold: Duration) -> Self {
        Self {
            store,
            interval,
            threshold,
        }
    }

    /// Run the sweep loop until `shutdown` fires. Cancellation is checked
    /// only between sweeps; an in-flight sweep always finishes, so a
    /// pipeline release is never interrupted halfway.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Evict every session idle past the threshold, returning how many
    /// were removed. A failing release is logged and does not stop the
    /// rest of the sweep.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for key in self.store.snapshot_idle(self.threshold, now) {
            // Re-checked at removal so a request that touched the session
            // after the snapshot keeps it alive.
            let Some(session) = self.store.evict_if_idle(&key, self.threshold) else {
                continue;
            };
            if let Err(e) = session.lock().await.cleanup() {
                warn!(client = %key, error = %e, "failed to release idle session");
            }
            info!(client = %key, "evicted idle session");
            evicted += 1;
        }
        evicted
    }
}
