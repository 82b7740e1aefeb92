//! Bounded rolling statistics windows for a circuit's error/latency history.
//!
//! Grounded on `proctor/tor.py`'s `_register_stats` (append then trim to a
//! fixed window `W`), kept as a ring-buffer-shaped `VecDeque` pair per the
//! "prefer a lock-free ring buffer" design note: same last-W-samples
//! semantics, bounded allocation.

use std::collections::VecDeque;

/// Fixed window size. Matches the source's `_stats_window = 200`.
pub const WINDOW: usize = 200;

/// Rolling error-count and per-socket elapsed-time samples, trimmed
/// together so both sequences always have equal length.
#[derive(Debug, Default)]
pub struct RollingStats {
    errors: VecDeque<u32>,
    timing: VecDeque<f64>,
}

/// Snapshot returned by [`RollingStats::summary`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSummary {
    pub errors_total: u64,
    pub timing_avg: f64,
    pub sample_count: usize,
}

impl RollingStats {
    pub fn new() -> Self {
        Self {
            errors: VecDeque::with_capacity(WINDOW),
            timing: VecDeque::with_capacity(WINDOW),
        }
    }

    /// Append one dialer's (elapsed_seconds, error_count) sample, trimming
    /// both sequences to `WINDOW` if needed.
    pub fn record(&mut self, elapsed_seconds: f64, errors: u32) {
        self.timing.push_back(elapsed_seconds);
        self.errors.push_back(errors);

        while self.timing.len() > WINDOW {
            self.timing.pop_front();
        }
        while self.errors.len() > WINDOW {
            self.errors.pop_front();
        }
    }

    pub fn summary(&self) -> StatsSummary {
        let sample_count = self.timing.len();
        let errors_total = self.errors.iter().map(|&e| e as u64).sum();
        let timing_sum: f64 = self.timing.iter().sum();
        let timing_avg = timing_sum / (sample_count.max(1) as f64);

        StatsSummary {
            errors_total,
            timing_avg,
            sample_count,
        }
    }

    /// Clear both sequences, used when a circuit restarts.
    pub fn reset(&mut self) {
        self.errors.clear();
        self.timing.clear();
    }

    pub fn invariant_holds(&self) -> bool {
        self.errors.len() == self.timing.len() && self.errors.len() <= WINDOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_has_zero_avg_not_nan() {
        let stats = RollingStats::new();
        let s = stats.summary();
        assert_eq!(s.sample_count, 0);
        assert_eq!(s.errors_total, 0);
        assert_eq!(s.timing_avg, 0.0);
    }

    #[test]
    fn trims_to_window_size() {
        let mut stats = RollingStats::new();
        for i in 0..(WINDOW + 50) {
            stats.record(i as f64, 1);
        }
        assert!(stats.invariant_holds());
        assert_eq!(stats.summary().sample_count, WINDOW);
    }

    #[test]
    fn keeps_only_last_w_entries() {
        let mut stats = RollingStats::new();
        for i in 0..(WINDOW + 1) {
            stats.record(i as f64, 0);
        }
        // the oldest sample (0.0) should have been evicted
        let avg = stats.summary().timing_avg;
        let expected_sum: f64 = (1..=WINDOW as u64).map(|v| v as f64).sum();
        assert!((avg - expected_sum / WINDOW as f64).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_both_sequences() {
        let mut stats = RollingStats::new();
        stats.record(1.0, 2);
        stats.reset();
        assert_eq!(stats.summary().sample_count, 0);
        assert!(stats.invariant_holds());
    }

    #[test]
    fn errors_total_sums_across_window() {
        let mut stats = RollingStats::new();
        stats.record(0.1, 3);
        stats.record(0.2, 1);
        assert_eq!(stats.summary().errors_total, 4);
    }
}


