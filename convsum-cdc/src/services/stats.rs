//! Cycle statistics
//!
//! Purely observational counters for operators; recording can never fail
//! and never interrupts the pipeline. Flushed through tracing on a fixed
//! cycle cadence.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles_completed: u64,
    pub conversations_processed: u64,
    pub conversations_failed: u64,
    pub conversations_skipped: u64,
    pub messages_dispatched: u64,
    pub messages_dispatch_failed: u64,
    pub results_received: u64,
    pub results_written: u64,
    pub results_skipped: u64,
    pub dead_lettered: u64,
}

/// Shared pipeline statistics
pub struct PipelineStats {
    started_at: DateTime<Utc>,
    inner: Mutex<StatsSnapshot>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            inner: Mutex::new(StatsSnapshot::default()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        // A poisoned lock still holds valid counters; keep counting
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }

    pub fn record_cycle(&self) -> u64 {
        let mut cycles = 0;
        self.update(|s| {
            s.cycles_completed += 1;
            cycles = s.cycles_completed;
        });
        cycles
    }

    pub fn record_processed(&self, count: u64) {
        self.update(|s| s.conversations_processed += count);
    }

    pub fn record_failed(&self, count: u64) {
        self.update(|s| s.conversations_failed += count);
    }

    pub fn record_skipped(&self, count: u64) {
        self.update(|s| s.conversations_skipped += count);
    }

    pub fn record_dispatched(&self) {
        self.update(|s| s.messages_dispatched += 1);
    }

    pub fn record_dispatch_failed(&self) {
        self.update(|s| s.messages_dispatch_failed += 1);
    }

    pub fn record_result_received(&self) {
        self.update(|s| s.results_received += 1);
    }

    pub fn record_result_written(&self) {
        self.update(|s| s.results_written += 1);
    }

    pub fn record_result_skipped(&self) {
        self.update(|s| s.results_skipped += 1);
    }

    pub fn record_dead_lettered(&self) {
        self.update(|s| s.dead_lettered += 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Emit the counters through tracing
    pub fn flush(&self) {
        let s = self.snapshot();
        let uptime = Utc::now() - self.started_at;
        tracing::info!(
            uptime_secs = uptime.num_seconds(),
            cycles = s.cycles_completed,
            processed = s.conversations_processed,
            failed = s.conversations_failed,
            skipped = s.conversations_skipped,
            dispatched = s.messages_dispatched,
            dispatch_failed = s.messages_dispatch_failed,
            results_received = s.results_received,
            results_written = s.results_written,
            results_skipped = s.results_skipped,
            dead_lettered = s.dead_lettered,
            "Pipeline statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PipelineStats::new();
        stats.record_processed(3);
        stats.record_processed(2);
        stats.record_dispatched();
        stats.record_result_written();

        let s = stats.snapshot();
        assert_eq!(s.conversations_processed, 5);
        assert_eq!(s.messages_dispatched, 1);
        assert_eq!(s.results_written, 1);
        assert_eq!(s.cycles_completed, 0);
    }

    #[test]
    fn record_cycle_returns_running_count() {
        let stats = PipelineStats::new();
        assert_eq!(stats.record_cycle(), 1);
        assert_eq!(stats.record_cycle(), 2);
    }
}
