//! `timestored`: wires the catalog, spool, ingestion workers, streaming
//! batchers and connectors into one process.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clap::Parser;
use data_types::{FlushThresholds, StorageTargetKind};
use ingester::{
    cache::MemoryManifestCache, events::LoggingEventPublisher, InlineJobQueue, IngestionProcessor,
    JobPayload, JobQueue, MemoryJobQueue, StagingWriteManager,
};
use spool::{FlushPolicy, SpoolConfig, SpoolManager};
use std::{path::PathBuf, sync::Arc, time::Duration};
use streaming::{
    BackpressureController, BulkLoader, FileTailer, NdjsonFileSource, StreamingBatcher,
};
use timestore_catalog::{
    interface::Catalog, mem::MemCatalog, postgres::PostgresCatalog, DEFAULT_STORAGE_TARGET_NAME,
};
use timestore_time::{SystemProvider, TimeProvider};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::{CatalogMode, QueueMode, ServiceConfig};

/// How often the sweeper re-evaluates the flush policy for every dataset.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for background tasks and in-flight jobs.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a `file://` broker stream is polled for new records.
const BROKER_FILE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[clap(name = "timestored", about = "Time-partitioned analytical data service")]
struct Args {
    /// Path to the JSON configuration file; defaults apply when omitted.
    #[clap(long, env = "TIMESTORED_CONFIG")]
    config: Option<PathBuf>,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };

    run(config).await
}

async fn run(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(metric::Registry::new());
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());

    let catalog: Arc<dyn Catalog> = match config.catalog.mode {
        CatalogMode::Memory => {
            warn!("using the in-memory catalog; metadata will not survive a restart");
            Arc::new(MemCatalog::new(
                Arc::clone(&metrics),
                Arc::clone(&time_provider),
            ))
        }
        CatalogMode::Postgres => {
            let dsn = config
                .catalog
                .dsn
                .as_deref()
                .ok_or("catalog.dsn is required in postgres mode")?;
            Arc::new(
                PostgresCatalog::connect(dsn, Arc::clone(&metrics), Arc::clone(&time_provider))
                    .await?,
            )
        }
    };
    catalog.setup().await?;

    // the configured storage becomes the system default target
    let kind: StorageTargetKind = config.storage.driver.parse()?;
    let target = catalog
        .repositories()
        .storage_targets()
        .create_or_get(
            DEFAULT_STORAGE_TARGET_NAME,
            kind,
            &serde_json::json!({"root": config.storage.root.to_string_lossy()}),
        )
        .await?;
    info!(target=%target.name, kind=%target.kind, root=%config.storage.root.display(), "default storage target ready");

    let spool = Arc::new(SpoolManager::new(
        SpoolConfig {
            root: config.staging.directory.clone(),
            max_dataset_bytes: config.staging.max_dataset_bytes,
            max_total_bytes: config.staging.max_total_bytes,
            resume_interrupted_flushes: config.staging.resume_interrupted_flushes,
        },
        &metrics,
        Arc::clone(&time_provider),
    ));
    let staging = Arc::new(StagingWriteManager::new(
        Arc::clone(&spool) as _,
        config.staging.max_pending_per_dataset,
    ));
    let flush_policy = FlushPolicy::new(
        FlushThresholds {
            max_rows: config.staging.flush.max_rows,
            max_bytes: config.staging.flush.max_bytes,
            max_age_ms: config.staging.flush.max_age_ms,
        },
        config.staging.flush.eager_when_bytes_only,
    );

    let processor = Arc::new(IngestionProcessor::new(
        Arc::clone(&catalog),
        Arc::clone(&spool),
        staging,
        flush_policy,
        Arc::new(LoggingEventPublisher),
        Arc::new(MemoryManifestCache::default()),
        &metrics,
    ));

    let (queue, worker_queue): (Arc<dyn JobQueue>, Option<Arc<MemoryJobQueue>>) =
        match config.queue.mode {
            QueueMode::Inline => {
                info!(name=%config.queue.name, "ingestion queue in inline mode");
                (
                    Arc::new(InlineJobQueue::new(Arc::clone(&processor) as _)),
                    None,
                )
            }
            QueueMode::Distributed => {
                info!(
                    name=%config.queue.name,
                    concurrency = config.queue.concurrency,
                    "ingestion queue in distributed mode",
                );
                let queue = Arc::new(MemoryJobQueue::new(
                    Arc::clone(&processor) as _,
                    config.queue.concurrency,
                    backoff::BackoffConfig::default(),
                    &metrics,
                ));
                (Arc::clone(&queue) as _, Some(queue))
            }
        };

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn(run_flush_sweeper(
        Arc::clone(&catalog),
        Arc::clone(&spool),
        flush_policy,
        Arc::clone(&queue),
        shutdown.clone(),
    )));

    if config.streaming.enabled {
        for batcher_config in &config.streaming.batchers {
            let source = match config.streaming.broker_url.as_deref() {
                Some(url) if url.starts_with("file://") => {
                    let path = url.trim_start_matches("file://");
                    NdjsonFileSource::open(
                        path,
                        BROKER_FILE_POLL_INTERVAL,
                        batcher_config.start_from_earliest,
                    )
                    .await?
                }
                Some(url) => {
                    warn!(
                        connector=%batcher_config.connector_id,
                        broker=%url,
                        "no consumer for this broker url is compiled in; batcher idle",
                    );
                    continue;
                }
                None => {
                    warn!(
                        connector=%batcher_config.connector_id,
                        "streaming enabled without a broker url; batcher idle",
                    );
                    continue;
                }
            };

            let batcher = Arc::new(StreamingBatcher::new(
                batcher_config.clone(),
                Arc::clone(&queue),
                Arc::clone(&time_provider),
                &metrics,
            ));
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                batcher.run(Box::new(source), shutdown).await;
            }));
        }
    }

    if config.connectors.enabled {
        let backpressure =
            BackpressureController::new(config.connectors.backpressure, Arc::clone(&queue));

        for tailer_config in &config.connectors.streaming {
            let tailer = FileTailer::new(
                tailer_config.clone(),
                Arc::clone(&queue),
                backpressure.clone(),
                Arc::clone(&time_provider),
                backoff::BackoffConfig::default(),
            );
            tasks.push(tokio::spawn(tailer.run(shutdown.clone())));
        }

        for bulk_config in &config.connectors.bulk {
            let loader = BulkLoader::new(
                bulk_config.clone(),
                Arc::clone(&queue),
                backpressure.clone(),
                backoff::BackoffConfig::default(),
            )?;
            tasks.push(tokio::spawn(loader.run(shutdown.clone())));
        }
    }

    info!("timestored ready");
    wait_for_signal().await;
    info!("shutdown signal received; draining");

    // stop intake first, then wait for background tasks and in-flight jobs
    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        error!("background tasks did not drain within the shutdown timeout");
    }
    if let Some(queue) = worker_queue {
        queue.shutdown(SHUTDOWN_TIMEOUT).await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Enqueues a flush job for every dataset whose spool satisfies the flush
/// policy. This is what makes the age threshold fire without new writes.
async fn run_flush_sweeper(
    catalog: Arc<dyn Catalog>,
    spool: Arc<SpoolManager>,
    flush_policy: FlushPolicy,
    queue: Arc<dyn JobQueue>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("flush sweeper stopped");
                return;
            }
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }

        let datasets = match catalog.repositories().datasets().list().await {
            Ok(datasets) => datasets,
            Err(e) => {
                warn!(%e, "flush sweeper cannot list datasets");
                continue;
            }
        };

        for dataset in datasets {
            let summary = match spool.dataset_summary(&dataset.slug).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(dataset=%dataset.slug, %e, "flush sweeper cannot read spool summary");
                    continue;
                }
            };

            let now = catalog.time_provider().now();
            if flush_policy
                .should_flush(&summary, dataset.flush_overrides(), now)
                .is_some()
            {
                let payload = JobPayload::Flush {
                    dataset_slug: dataset.slug.clone(),
                };
                if let Err(e) = queue.enqueue(payload).await {
                    warn!(dataset=%dataset.slug, %e, "flush job failed");
                }
            }
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(%e, "cannot install SIGTERM handler; relying on ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
