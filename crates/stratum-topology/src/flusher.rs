//! Background task that persists chunkserver state updates.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::topology::Topology;

/// Drives [`Topology::flush_chunk_server_states`] on a fixed interval.
pub struct StateFlusher {
    topology: Arc<Topology>,
    interval: Duration,
}

impl StateFlusher {
    /// Creates a flusher for `topology` ticking every `interval`.
    pub fn new(topology: Arc<Topology>, interval: Duration) -> Self {
        Self { topology, interval }
    }

    /// Runs until `shutdown` turns true or its sender is dropped, then
    /// flushes once more before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "state flusher started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush_once().await;
        tracing::info!("state flusher stopped");
    }

    /// Flushes on the blocking pool, since storage calls block.
    async fn flush_once(&self) -> usize {
        let topology = Arc::clone(&self.topology);
        match tokio::task::spawn_blocking(move || topology.flush_chunk_server_states()).await {
            Ok(Ok(flushed)) => flushed,
            Ok(Err(e)) => {
                tracing::error!("chunkserver state flush failed: {}", e);
                0
            }
            Err(e) => {
                tracing::error!("chunkserver state flush task panicked: {}", e);
                0
            }
        }
    }
}
