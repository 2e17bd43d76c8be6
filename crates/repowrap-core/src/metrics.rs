//! Global atomic counters.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a run finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    stage_attempts: AtomicU64,
    repairs_applied: AtomicU64,
    timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            stage_attempts: AtomicU64::new(0),
            repairs_applied: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_completed", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    pub fn inc_stage_attempts(&self) {
        self.stage_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stage_attempts", "counter incremented");
    }

    pub fn inc_repairs(&self) {
        self.repairs_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "repairs_applied", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_completed = self.runs_completed(),
            runs_failed = self.runs_failed(),
            stage_attempts = self.stage_attempts(),
            repairs_applied = self.repairs_applied(),
            timeouts = self.timeouts(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn stage_attempts(&self) -> u64 {
        self.stage_attempts.load(Ordering::Relaxed)
    }

    pub fn repairs_applied(&self) -> u64 {
        self.repairs_applied.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.runs_started,
            &self.runs_completed,
            &self.runs_failed,
            &self.stage_attempts,
            &self.repairs_applied,
            &self.timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
