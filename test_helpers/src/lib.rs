//! Shared helpers for tests: opt-in log capture and scratch directories.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Once;
use tempfile::{NamedTempFile, TempDir};

static LOG_SETUP: Once = Once::new();

/// Enables a tracing subscriber for a test if the `RUST_LOG` environment
/// variable is set.
///
/// Call at the start of a test to see its log output:
///
/// ```text
/// RUST_LOG=debug cargo test --workspace spool
/// ```
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables a tracing subscriber honouring `RUST_LOG`, once per process.
pub fn start_logging() {
    // tests can run in parallel within the same process; installation must
    // only happen once
    LOG_SETUP.call_once(|| {
        tracing_log::LogTracer::init().expect("log forwarding installed twice");
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("tracing subscriber installed twice");
    });
}

/// Create a scratch directory removed on drop.
pub fn tmp_dir() -> std::io::Result<TempDir> {
    let _ = dotenvy::dotenv();

    let root = std::env::var_os("TEST_TMP_DIR").unwrap_or_else(|| std::env::temp_dir().into());

    tempfile::Builder::new()
        .prefix("timestore")
        .tempdir_in(root)
}

/// Create a scratch file removed on drop.
pub fn tmp_file() -> std::io::Result<NamedTempFile> {
    let _ = dotenvy::dotenv();

    let root = std::env::var_os("TEST_TMP_DIR").unwrap_or_else(|| std::env::temp_dir().into());

    tempfile::Builder::new()
        .prefix("timestore")
        .tempfile_in(root)
}
