//! The ingestion job queue and its workers.
//!
//! Inline mode runs the processor synchronously in the caller's task, for
//! single-process deployments and tests. Distributed mode is an in-process
//! durable queue: jobs are deduplicated by id, picked up by a bounded pool
//! of workers, retried with exponential backoff, and failed with a metric
//! once retries are exhausted. A queue backed by an external broker plugs in
//! behind the same trait.

use crate::job::{IngestError, IngestOutcome, JobFailure, JobPayload};
use crate::processor::IngestionProcessor;
use async_trait::async_trait;
use backoff::{BackoffConfig, RetryError};
use metric::U64Counter;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors enqueueing or (in inline mode) running a job.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job ran and failed.
    #[error("job failed: {failure}")]
    Job {
        /// The caller-visible failure record.
        failure: JobFailure,
    },

    /// The queue is not accepting jobs (e.g. shutting down).
    #[error("queue unavailable: {reason}")]
    Unavailable {
        /// Why.
        reason: String,
    },
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Inline mode: the job ran to completion.
    Completed(IngestOutcome),
    /// The job was queued.
    Enqueued {
        /// Queue-level job id.
        job_id: String,
    },
    /// A job with the same id is already queued; nothing was added.
    Duplicate {
        /// The existing job id.
        job_id: String,
    },
}

/// Something that can run an ingestion job. Implemented by the processor;
/// test doubles script outcomes.
#[async_trait]
pub trait JobProcessor: Debug + Send + Sync + 'static {
    /// Run one job to completion.
    async fn process(&self, payload: JobPayload) -> Result<IngestOutcome, IngestError>;
}

#[async_trait]
impl JobProcessor for IngestionProcessor {
    async fn process(&self, payload: JobPayload) -> Result<IngestOutcome, IngestError> {
        Self::process(self, payload).await
    }
}

/// A durable job queue keyed by dataset slug.
#[async_trait]
pub trait JobQueue: Debug + Send + Sync {
    /// Add a job, or run it synchronously in inline mode.
    async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueOutcome, QueueError>;

    /// Jobs queued or in flight. Consulted by connector backpressure.
    fn depth(&self) -> usize;
}

/// Queue-disabled mode: runs each job synchronously and returns its result.
#[derive(Debug)]
pub struct InlineJobQueue {
    processor: Arc<dyn JobProcessor>,
}

impl InlineJobQueue {
    /// Create an inline queue over `processor`.
    pub fn new(processor: Arc<dyn JobProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobQueue for InlineJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueOutcome, QueueError> {
        match self.processor.process(payload).await {
            Ok(outcome) => Ok(EnqueueOutcome::Completed(outcome)),
            Err(e) => Err(QueueError::Job {
                failure: e.to_failure(),
            }),
        }
    }

    fn depth(&self) -> usize {
        0
    }
}

#[derive(Debug)]
struct QueuedJob {
    id: String,
    payload: JobPayload,
}

#[derive(Debug)]
struct QueueShared {
    pending: Mutex<HashSet<String>>,
    depth: AtomicUsize,
    success_counter: U64Counter,
    failure_counter: U64Counter,
}

/// In-process distributed-mode queue with a bounded worker pool.
#[derive(Debug)]
pub struct MemoryJobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    shared: Arc<QueueShared>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryJobQueue {
    /// Create the queue and spawn `concurrency` worker tasks.
    pub fn new(
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
        backoff_config: BackoffConfig,
        metrics: &metric::Registry,
    ) -> Self {
        let job_metric = metrics.register_metric::<U64Counter>(
            "ingest_queue_jobs",
            "jobs completed by the queue workers, by result",
        );
        let shared = Arc::new(QueueShared {
            pending: Default::default(),
            depth: AtomicUsize::new(0),
            success_counter: job_metric.recorder(&[("result", "success")]),
            failure_counter: job_metric.recorder(&[("result", "failure")]),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let concurrency = concurrency.max(1);
        let workers = (0..concurrency)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&rx),
                    Arc::clone(&processor),
                    Arc::clone(&shared),
                    backoff_config,
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            shared,
            shutdown,
            workers: Mutex::new(workers),
        }
    }

    /// Stop accepting jobs, let in-flight jobs finish (up to `timeout`), and
    /// join the workers.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        if tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            error!("queue workers did not drain within the shutdown timeout");
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueOutcome, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Unavailable {
                reason: "queue is shutting down".to_string(),
            });
        }

        let job_id = payload.job_id();
        {
            let mut pending = self.shared.pending.lock();
            if !pending.insert(job_id.clone()) {
                // duplicates collapse at the queue level
                return Ok(EnqueueOutcome::Duplicate { job_id });
            }
        }
        self.shared.depth.fetch_add(1, Ordering::SeqCst);

        if self
            .tx
            .send(QueuedJob {
                id: job_id.clone(),
                payload,
            })
            .is_err()
        {
            self.shared.pending.lock().remove(&job_id);
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Unavailable {
                reason: "queue workers are gone".to_string(),
            });
        }

        Ok(EnqueueOutcome::Enqueued { job_id })
    }

    fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    processor: Arc<dyn JobProcessor>,
    shared: Arc<QueueShared>,
    backoff_config: BackoffConfig,
    shutdown: CancellationToken,
) {
    loop {
        // hold the receiver lock only while waiting for a job, so an
        // in-flight job never starves the other workers
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id, "queue worker stopped");
                    return;
                }
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            return;
        };

        let result = backoff::retry_with_backoff(
            &backoff_config,
            "ingest_job",
            IngestError::is_retryable,
            || {
                let processor = Arc::clone(&processor);
                let payload = job.payload.clone();
                async move { processor.process(payload).await }
            },
        )
        .await;

        shared.pending.lock().remove(&job.id);
        shared.depth.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(_) => shared.success_counter.inc(1),
            Err(retry_err) => {
                shared.failure_counter.inc(1);
                let failure = match &retry_err {
                    RetryError::Permanent { source } => source.to_failure(),
                    RetryError::Exhausted { source, .. } => source.to_failure(),
                };
                error!(
                    worker_id,
                    job_id=%job.id,
                    %failure,
                    "ingestion job failed",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use metric::{Attributes, Metric};

    fn payload(key: &str) -> JobPayload {
        JobPayload::Ingest {
            ingestion: serde_json::from_value(serde_json::json!({
                "datasetSlug": "obs-1",
                "schema": {"fields": [{"name": "t", "type": "timestamp"}]},
                "partition": {
                    "key": {},
                    "timeRange": {
                        "start": "2024-01-01T00:00:00Z",
                        "end": "2024-01-01T00:00:00Z",
                    },
                },
                "rows": [],
                "idempotencyKey": key,
            }))
            .unwrap(),
        }
    }

    /// Fails with a transient error `failures` times, then succeeds.
    #[derive(Debug)]
    struct FlakyProcessor {
        failures: AtomicUsize,
        calls: AtomicUsize,
        done: tokio::sync::Notify,
    }

    impl FlakyProcessor {
        fn new(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                done: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl JobProcessor for FlakyProcessor {
        async fn process(&self, _payload: JobPayload) -> Result<IngestOutcome, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(IngestError::Spool {
                    source: spool::Error::LockTimeout {
                        path: "staging.lock".into(),
                    },
                });
            }
            self.done.notify_one();
            Ok(IngestOutcome::NoOp)
        }
    }

    /// Always fails with a permanent validation error.
    #[derive(Debug)]
    struct RejectingProcessor {
        calls: AtomicUsize,
        done: tokio::sync::Notify,
    }

    #[async_trait]
    impl JobProcessor for RejectingProcessor {
        async fn process(&self, payload: JobPayload) -> Result<IngestOutcome, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
            let JobPayload::Ingest { ingestion } = payload else {
                panic!("unexpected payload")
            };
            let mut bad = ingestion;
            bad.dataset_slug = String::new();
            Err(IngestError::Validation {
                source: bad.validate().unwrap_err(),
            })
        }
    }

    fn backoff_config() -> BackoffConfig {
        BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn inline_mode_runs_synchronously() {
        let processor = Arc::new(FlakyProcessor::new(0));
        let queue = InlineJobQueue::new(Arc::clone(&processor) as _);

        let outcome = queue.enqueue(payload("k1")).await.unwrap();
        assert_matches!(outcome, EnqueueOutcome::Completed(IngestOutcome::NoOp));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn duplicate_job_ids_collapse() {
        let processor = Arc::new(FlakyProcessor::new(0));
        let metrics = metric::Registry::new();
        let queue = MemoryJobQueue::new(Arc::clone(&processor) as _, 1, backoff_config(), &metrics);

        let first = queue.enqueue(payload("k1")).await.unwrap();
        let job_id = assert_matches!(first, EnqueueOutcome::Enqueued { job_id } => job_id);
        assert_eq!(job_id, "obs-1-k1");

        // the worker may or may not have drained k1 already; either way the
        // id is stable and at most one job per id is ever pending
        let second = queue.enqueue(payload("k1")).await;
        match second.unwrap() {
            EnqueueOutcome::Duplicate { job_id } | EnqueueOutcome::Enqueued { job_id } => {
                assert_eq!(job_id, "obs-1-k1")
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        queue.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn workers_retry_transient_failures() {
        let processor = Arc::new(FlakyProcessor::new(2));
        let metrics = metric::Registry::new();
        let queue = MemoryJobQueue::new(Arc::clone(&processor) as _, 2, backoff_config(), &metrics);

        queue.enqueue(payload("k1")).await.unwrap();
        processor.done.notified().await;
        queue.shutdown(Duration::from_secs(1)).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.depth(), 0);

        let jobs: Metric<U64Counter> = metrics.get_instrument("ingest_queue_jobs").unwrap();
        assert_eq!(
            jobs.get_observer(&Attributes::from(&[("result", "success")]))
                .unwrap()
                .fetch(),
            1
        );
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let processor = Arc::new(RejectingProcessor {
            calls: AtomicUsize::new(0),
            done: tokio::sync::Notify::new(),
        });
        let metrics = metric::Registry::new();
        let queue = MemoryJobQueue::new(Arc::clone(&processor) as _, 1, backoff_config(), &metrics);

        queue.enqueue(payload("k1")).await.unwrap();
        processor.done.notified().await;
        queue.shutdown(Duration::from_secs(1)).await;

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        let jobs: Metric<U64Counter> = metrics.get_instrument("ingest_queue_jobs").unwrap();
        assert_eq!(
            jobs.get_observer(&Attributes::from(&[("result", "failure")]))
                .unwrap()
                .fetch(),
            1
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let processor = Arc::new(FlakyProcessor::new(0));
        let metrics = metric::Registry::new();
        let queue = MemoryJobQueue::new(Arc::clone(&processor) as _, 1, backoff_config(), &metrics);

        queue.shutdown(Duration::from_millis(100)).await;
        let err = queue.enqueue(payload("k1")).await.unwrap_err();
        assert_matches!(err, QueueError::Unavailable { .. });
    }
}
