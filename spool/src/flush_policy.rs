//! Decides when a dataset's staged batches should be flushed.

use crate::DatasetSummary;
use data_types::{FlushOverrides, FlushThresholds};
use timestore_time::Time;

/// Which condition triggered a flush. Used to label the flush counter so
/// operators can see what is driving persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Pending rows reached the row threshold.
    Rows,
    /// The spool database reached the byte threshold.
    Bytes,
    /// The oldest staged batch reached the age threshold.
    Age,
    /// All thresholds are disabled; anything staged flushes immediately.
    Unconditional,
    /// Only the byte threshold is configured and eager mode is on.
    Eager,
}

impl FlushTrigger {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rows => "rows",
            Self::Bytes => "bytes",
            Self::Age => "age",
            Self::Unconditional => "unconditional",
            Self::Eager => "eager",
        }
    }
}

/// Service-level flush policy. Dataset metadata overrides are applied per
/// decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushPolicy {
    /// Baseline thresholds; zero disables a trigger.
    pub thresholds: FlushThresholds,
    /// When only the byte threshold is configured, flush eagerly instead of
    /// waiting for bytes to accumulate.
    pub eager_when_bytes_only: bool,
}

impl FlushPolicy {
    /// Create a policy from thresholds.
    pub fn new(thresholds: FlushThresholds, eager_when_bytes_only: bool) -> Self {
        Self {
            thresholds,
            eager_when_bytes_only,
        }
    }

    /// Whether `summary` should be flushed at `now`, and why.
    ///
    /// Returns `None` when nothing is staged or no trigger fired. Overrides
    /// are applied on top of the baseline thresholds before evaluation, so a
    /// dataset re-enabling the row threshold also opts out of eager mode.
    pub fn should_flush(
        &self,
        summary: &DatasetSummary,
        overrides: FlushOverrides,
        now: Time,
    ) -> Option<FlushTrigger> {
        if summary.pending_batch_count == 0 {
            return None;
        }

        let t = overrides.apply(self.thresholds);

        if t.max_rows == 0 && t.max_bytes == 0 && t.max_age_ms == 0 {
            return Some(FlushTrigger::Unconditional);
        }

        if t.max_rows > 0 && summary.pending_row_count >= t.max_rows {
            return Some(FlushTrigger::Rows);
        }

        if t.max_bytes > 0 && summary.on_disk_bytes >= t.max_bytes {
            return Some(FlushTrigger::Bytes);
        }

        if t.max_age_ms > 0 {
            if let Some(oldest) = summary.oldest_staged_at {
                let age_ms = now
                    .checked_duration_since(oldest.to_time())
                    .map(|age| age.as_millis() as i64)
                    .unwrap_or(0);
                if age_ms >= t.max_age_ms {
                    return Some(FlushTrigger::Age);
                }
            }
        }

        if self.eager_when_bytes_only && t.max_bytes > 0 && t.max_rows == 0 && t.max_age_ms == 0 {
            return Some(FlushTrigger::Eager);
        }

        None
    }
}
