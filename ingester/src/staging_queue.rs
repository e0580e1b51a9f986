//! The staging write manager: a per-dataset FIFO in front of the spool.
//!
//! The spool itself serializes writers per dataset; this layer adds the
//! capacity contract. Each dataset has a budget of
//! `max_pending_per_dataset` requests covering both queued and in-flight
//! work, and requests beyond it are rejected so producers feel backpressure
//! instead of growing an unbounded queue.

use async_trait::async_trait;
use parking_lot::Mutex;
use spool::{SpoolManager, StageOutcome, StagePartitionRequest};
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Errors from the staging write manager.
#[derive(Debug, Error)]
pub enum StagingQueueError {
    /// The dataset already has `max_pending_per_dataset` requests queued or
    /// in flight.
    #[error("staging queue for dataset {dataset} is full ({max} pending)")]
    Full {
        /// The dataset at capacity.
        dataset: String,
        /// The configured budget.
        max: usize,
    },

    /// The underlying spool failed.
    #[error(transparent)]
    Spool {
        /// The spool error.
        #[from]
        source: spool::Error,
    },
}

/// The staging backend the write manager serializes. Implemented by the
/// spool; test doubles substitute controllable behavior.
#[async_trait]
pub trait StageBackend: Debug + Send + Sync {
    /// Stage one batch.
    async fn stage_partition(
        &self,
        request: StagePartitionRequest,
    ) -> spool::Result<StageOutcome>;
}

#[async_trait]
impl StageBackend for SpoolManager {
    async fn stage_partition(
        &self,
        request: StagePartitionRequest,
    ) -> spool::Result<StageOutcome> {
        Self::stage_partition(self, request).await
    }
}

#[derive(Debug, Default)]
struct DatasetQueue {
    /// Queued plus in-flight requests.
    depth: AtomicUsize,
    /// Fair mutex; waiters are served in FIFO order, and holding it is what
    /// makes a request "in flight".
    writer: tokio::sync::Mutex<()>,
}

/// Serializes concurrent stage requests per dataset and enforces the
/// capacity budget.
#[derive(Debug)]
pub struct StagingWriteManager {
    backend: Arc<dyn StageBackend>,
    max_pending_per_dataset: usize,
    queues: Mutex<HashMap<String, Arc<DatasetQueue>>>,
}

impl StagingWriteManager {
    /// Create a manager over `backend` with the given per-dataset budget.
    pub fn new(backend: Arc<dyn StageBackend>, max_pending_per_dataset: usize) -> Self {
        Self {
            backend,
            max_pending_per_dataset: max_pending_per_dataset.max(1),
            queues: Default::default(),
        }
    }

    fn queue(&self, slug: &str) -> Arc<DatasetQueue> {
        let mut queues = self.queues.lock();
        Arc::clone(queues.entry(slug.to_string()).or_default())
    }

    /// Queued plus in-flight requests for `slug`.
    pub fn depth(&self, slug: &str) -> usize {
        self.queue(slug).depth.load(Ordering::SeqCst)
    }

    /// Stage one batch, waiting behind earlier requests for the same
    /// dataset. Rejects immediately when the dataset budget is exhausted.
    pub async fn stage(
        &self,
        request: StagePartitionRequest,
    ) -> Result<StageOutcome, StagingQueueError> {
        let queue = self.queue(&request.dataset_slug);

        // reserve a slot before queueing; queued and in-flight requests
        // share the budget
        let mut current = queue.depth.load(Ordering::SeqCst);
        loop {
            if current >= self.max_pending_per_dataset {
                return Err(StagingQueueError::Full {
                    dataset: request.dataset_slug.clone(),
                    max: self.max_pending_per_dataset,
                });
            }
            match queue.depth.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        let _slot = SlotGuard(&queue.depth);

        let _writer = queue.writer.lock().await;
        Ok(self.backend.stage_partition(request).await?)
    }
}

struct SlotGuard<'a>(&'a AtomicUsize);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
