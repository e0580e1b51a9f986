//! Bounded exponential backoff with jitter.
//!
//! Retry loops in the ingestion workers and connectors must give up
//! eventually so that a poisoned job can be failed and surfaced; this crate
//! therefore caps the number of attempts and lets the caller classify which
//! errors are worth retrying at all.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use rand::prelude::*;
use std::time::Duration;
use tracing::info;

/// Exponential backoff with jitter.
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Maximum number of attempts (including the first) before giving up.
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 2.,
            max_attempts: 5,
        }
    }
}

/// Error returned once retrying has been abandoned.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error the caller classified as not
    /// retryable.
    Permanent {
        /// The error of the failed attempt.
        source: E,
    },

    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        /// Number of attempts made.
        attempts: usize,
        /// The error of the final attempt.
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The error of the last attempt, regardless of why retrying stopped.
    pub fn into_source(self) -> E {
        match self {
            Self::Permanent { source } => source,
            Self::Exhausted { source, .. } => source,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Permanent { source } => write!(f, "permanent error: {source}"),
            Self::Exhausted { attempts, source } => {
                write!(f, "still failing after {attempts} attempts: {source}")
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Permanent { source } => Some(source),
            Self::Exhausted { source, .. } => Some(source),
        }
    }
}

/// Iterator-style backoff interval generator created from a [`BackoffConfig`].
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`.
    ///
    /// Uses [`rand::thread_rng()`] if no rng is provided.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for.
    pub fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }
}

/// Run `do_stuff` until it succeeds, the error is classified as permanent by
/// `is_retryable`, or `config.max_attempts` attempts have been made.
///
/// Sleeps a jittered exponential backoff between attempts.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &BackoffConfig,
    task_name: &str,
    is_retryable: impl Fn(&E) -> bool + Send,
    mut do_stuff: F,
) -> Result<T, RetryError<E>>
where
    F: (FnMut() -> Fut) + Send,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
    E: std::fmt::Display + Send,
{
    let mut backoff = Backoff::new(config);
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        // execute `F` first and then use it, so `F` does not need to be `Sync`
        let fut = do_stuff();

        let e = match fut.await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if !is_retryable(&e) {
            return Err(RetryError::Permanent { source: e });
        }
        if attempt == max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: e,
            });
        }

        let sleep = backoff.next();
        info!(
            e=%e,
            task_name,
            attempt,
            backoff_secs = sleep.as_secs_f64(),
            "operation failed with retryable error - backing off",
        );
        tokio::time::sleep(sleep).await;
    }

    unreachable!("loop either returns or errors on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn intervals_grow_until_capped() {
        let init_backoff_secs = 1.;
        let max_backoff_secs = 50.;
        let base = 2.;

        let config = BackoffConfig {
            init_backoff: Duration::from_secs_f64(init_backoff_secs),
            max_backoff: Duration::from_secs_f64(max_backoff_secs),
            base,
            max_attempts: 10,
        };

        let assert_fuzzy_eq = |a: f64, b: f64| assert!((b - a).abs() < 0.0001, "{} != {}", a, b);

        // a static rng that always takes the maximum of the range makes the
        // sequence deterministic
        let rng = Box::new(StepRng::new(u64::MAX, 0));
        let mut backoff = Backoff::new_with_rng(&config, Some(rng));

        for i in 0..20 {
            let value = (base.powi(i) * init_backoff_secs).min(max_backoff_secs);
            assert_fuzzy_eq(backoff.next().as_secs_f64(), value);
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.,
            max_attempts: 5,
        };

        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(
            &config,
            "test",
            |_: &String| true,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            base: 2.,
            max_attempts: 3,
        };

        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &config,
            "test",
            |_: &String| true,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("transient".to_string())
            },
        )
        .await;

        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_short_circuit() {
        let config = BackoffConfig::default();

        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &config,
            "test",
            |e: &String| e == "transient",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("permanent".to_string())
            },
        )
        .await;

        assert!(matches!(result.unwrap_err(), RetryError::Permanent { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
