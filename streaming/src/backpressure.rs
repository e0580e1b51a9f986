//! Producer-side slowdown when the ingestion queue runs deep.

use ingester::JobQueue;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Watermarks and pause bounds shared by all connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureConfig {
    /// Pause producing once the queue holds this many jobs.
    pub high_watermark: usize,
    /// Resume once the queue drains below this.
    pub low_watermark: usize,
    /// Shortest pause between depth checks.
    pub min_pause_ms: u64,
    /// Longest pause between depth checks.
    pub max_pause_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 512,
            low_watermark: 128,
            min_pause_ms: 50,
            max_pause_ms: 5_000,
        }
    }
}

/// Pauses connectors while the queue is above its watermarks.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    config: BackpressureConfig,
    queue: Arc<dyn JobQueue>,
}

impl BackpressureController {
    /// Create a controller over `queue`.
    pub fn new(config: BackpressureConfig, queue: Arc<dyn JobQueue>) -> Self {
        Self { config, queue }
    }

    /// Whether producing should pause right now.
    pub fn is_saturated(&self) -> bool {
        self.queue.depth() >= self.config.high_watermark.max(1)
    }

    /// Block until the queue has drained below the low watermark (or
    /// shutdown fires). Pause lengths double from the minimum up to the
    /// maximum while the queue stays deep.
    pub async fn wait_until_clear(&self, shutdown: &CancellationToken) {
        if !self.is_saturated() {
            return;
        }

        info!(
            depth = self.queue.depth(),
            high_watermark = self.config.high_watermark,
            "queue above high watermark; pausing connector",
        );

        let min_pause = self.config.min_pause_ms.max(1);
        let max_pause = self.config.max_pause_ms.max(min_pause);
        let mut pause_ms = min_pause;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(pause_ms)) => {}
            }

            let depth = self.queue.depth();
            if depth < self.config.low_watermark.max(1) {
                debug!(depth, "queue drained below low watermark; resuming");
                return;
            }
            pause_ms = (pause_ms * 2).clamp(min_pause, max_pause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ingester::{EnqueueOutcome, JobPayload, QueueError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FixedDepthQueue(AtomicUsize);

    #[async_trait]
    impl JobQueue for FixedDepthQueue {
        async fn enqueue(&self, _payload: JobPayload) -> Result<EnqueueOutcome, QueueError> {
            unimplemented!("depth-only test double")
        }

        fn depth(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn below_high_watermark_does_not_pause() {
        let queue = Arc::new(FixedDepthQueue(AtomicUsize::new(3)));
        let controller = BackpressureController::new(
            BackpressureConfig {
                high_watermark: 4,
                low_watermark: 2,
                min_pause_ms: 1,
                max_pause_ms: 2,
            },
            Arc::clone(&queue) as _,
        );

        assert!(!controller.is_saturated());
        controller.wait_until_clear(&CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn pauses_until_drained_below_low_watermark() {
        let queue = Arc::new(FixedDepthQueue(AtomicUsize::new(10)));
        let controller = BackpressureController::new(
            BackpressureConfig {
                high_watermark: 4,
                low_watermark: 2,
                min_pause_ms: 1,
                max_pause_ms: 5,
            },
            Arc::clone(&queue) as _,
        );
        assert!(controller.is_saturated());

        let drainer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.0.store(1, Ordering::SeqCst);
            })
        };

        controller.wait_until_clear(&CancellationToken::new()).await;
        assert_eq!(queue.depth(), 1);
        drainer.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_pause() {
        let queue = Arc::new(FixedDepthQueue(AtomicUsize::new(10)));
        let controller = BackpressureController::new(
            BackpressureConfig {
                high_watermark: 4,
                low_watermark: 2,
                min_pause_ms: 60_000,
                max_pause_ms: 60_000,
            },
            Arc::clone(&queue) as _,
        );

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // returns promptly despite the long configured pause
        controller.wait_until_clear(&shutdown).await;
    }
}
