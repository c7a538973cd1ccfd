//! Gateway counters.
//!
//! All counters are independent, monotonically increasing `AtomicU64`s
//! updated with `Ordering::Relaxed`. A [`MetricsSnapshot`] reads them one by
//! one, so counters may be slightly inconsistent relative to each other; this
//! is fine for telemetry.
//!
//! ```
//! use docstore_gateway::Metrics;
//!
//! let metrics = Metrics::new();
//! metrics.record_attempt();
//! metrics.record_retry();
//! assert_eq!(metrics.snapshot().retry_count, 1);
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
    suppressed: AtomicU64,
    admission_rejected: AtomicU64,
    panics_caught: AtomicU64,
    batch_redrives: AtomicU64,
    batch_leftover_items: AtomicU64,
}

/// Shared, cheaply cloneable gateway counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Counters>,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Backend attempts made by the retry loop.
    pub attempt_count: u64,
    /// Attempts that were followed by another attempt.
    pub retry_count: u64,
    /// Retry loops that ran out of budget with the error still present.
    pub retry_exhausted_count: u64,
    /// Errors reported to the caller as success under the suppression policy.
    pub suppressed_count: u64,
    /// Calls rejected by the admission gate (shutdown, timeout, cancellation).
    pub admission_rejected_count: u64,
    /// Panics caught at the admission boundary.
    pub panics_caught_count: u64,
    /// Batch re-drives of unprocessed subsets.
    pub batch_redrive_count: u64,
    /// Batch items or keys left unprocessed after the re-drive budget.
    pub batch_leftover_count: u64,
}

impl Metrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one backend attempt.
    pub fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an attempt that will be followed by another.
    pub fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a retry loop that ran out of budget.
    pub fn record_retry_exhausted(&self) {
        self.inner.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an error reported as success.
    pub fn record_suppressed(&self) {
        self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a call turned away at the admission gate.
    pub fn record_admission_rejected(&self) {
        self.inner.admission_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a panic caught at the admission boundary.
    pub fn record_panic(&self) {
        self.inner.panics_caught.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one batch re-drive.
    pub fn record_batch_redrive(&self) {
        self.inner.batch_redrives.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `count` items left unprocessed by a batch.
    pub fn record_batch_leftover(&self, count: usize) {
        self.inner.batch_leftover_items.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner;
        MetricsSnapshot {
            attempt_count: c.attempts.load(Ordering::Relaxed),
            retry_count: c.retries.load(Ordering::Relaxed),
            retry_exhausted_count: c.retries_exhausted.load(Ordering::Relaxed),
            suppressed_count: c.suppressed.load(Ordering::Relaxed),
            admission_rejected_count: c.admission_rejected.load(Ordering::Relaxed),
            panics_caught_count: c.panics_caught.load(Ordering::Relaxed),
            batch_redrive_count: c.batch_redrives.load(Ordering::Relaxed),
            batch_leftover_count: c.batch_leftover_items.load(Ordering::Relaxed),
        }
    }
}
