//! # Snapshot Metrics
//!
//! Lock-free counters for the snapshot and streaming phases.
//!
//! Every counter is mirrored to the `metrics` facade so any installed
//! recorder (Prometheus, StatsD, ...) picks it up:
//!
//! | Metric | Meaning |
//! |--------|---------|
//! | `tessera_cdc_chunks_split_total` | chunks generated by the splitter |
//! | `tessera_cdc_chunks_finished_total` | chunks merged and emitted |
//! | `tessera_cdc_chunks_retried_total` | chunk restarts |
//! | `tessera_cdc_snapshot_rows_total` | rows returned by bulk reads |
//! | `tessera_cdc_window_events_total` | window events replayed into chunks |
//! | `tessera_cdc_streaming_events_total` | streaming events emitted |
//! | `tessera_cdc_streaming_suppressed_total` | streaming events covered by a chunk |
//! | `tessera_cdc_streaming_position` | last emitted streaming position (gauge) |

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one incremental snapshot job.
#[derive(Debug, Default)]
pub struct SnapshotStats {
    chunks_split: AtomicU64,
    chunks_finished: AtomicU64,
    chunks_retried: AtomicU64,
    snapshot_rows: AtomicU64,
    window_events: AtomicU64,
    streaming_emitted: AtomicU64,
    streaming_suppressed: AtomicU64,
    streaming_position: AtomicU64,
}

impl SnapshotStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunks_split(&self, count: u64) {
        self.chunks_split.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("tessera_cdc_chunks_split_total").increment(count);
    }

    /// Record a merged chunk.
    pub fn record_chunk_finished(&self, rows: u64, window_events: u64) {
        self.chunks_finished.fetch_add(1, Ordering::Relaxed);
        self.snapshot_rows.fetch_add(rows, Ordering::Relaxed);
        self.window_events.fetch_add(window_events, Ordering::Relaxed);
        metrics::counter!("tessera_cdc_chunks_finished_total").increment(1);
        metrics::counter!("tessera_cdc_snapshot_rows_total").increment(rows);
        metrics::counter!("tessera_cdc_window_events_total").increment(window_events);
    }

    pub fn record_chunk_retry(&self, error_code: &'static str) {
        self.chunks_retried.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tessera_cdc_chunks_retried_total", "error" => error_code).increment(1);
    }

    /// Record an emitted streaming event at `position`.
    pub fn record_streaming_emitted(&self, position: u64) {
        self.streaming_emitted.fetch_add(1, Ordering::Relaxed);
        self.streaming_position.fetch_max(position, Ordering::Relaxed);
        metrics::counter!("tessera_cdc_streaming_events_total").increment(1);
        metrics::gauge!("tessera_cdc_streaming_position").set(position as f64);
    }

    pub fn record_streaming_suppressed(&self) {
        self.streaming_suppressed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tessera_cdc_streaming_suppressed_total").increment(1);
    }

    pub fn snapshot(&self) -> SnapshotStatsSnapshot {
        SnapshotStatsSnapshot {
            chunks_split: self.chunks_split.load(Ordering::Relaxed),
            chunks_finished: self.chunks_finished.load(Ordering::Relaxed),
            chunks_retried: self.chunks_retried.load(Ordering::Relaxed),
            snapshot_rows: self.snapshot_rows.load(Ordering::Relaxed),
            window_events: self.window_events.load(Ordering::Relaxed),
            streaming_emitted: self.streaming_emitted.load(Ordering::Relaxed),
            streaming_suppressed: self.streaming_suppressed.load(Ordering::Relaxed),
            streaming_position: self.streaming_position.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SnapshotStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStatsSnapshot {
    pub chunks_split: u64,
    pub chunks_finished: u64,
    pub chunks_retried: u64,
    pub snapshot_rows: u64,
    pub window_events: u64,
    pub streaming_emitted: u64,
    pub streaming_suppressed: u64,
    pub streaming_position: u64,
}

impl SnapshotStatsSnapshot {
    /// Fraction of generated chunks that finished (1.0 when nothing to do).
    pub fn chunk_progress(&self) -> f64 {
        if self.chunks_split == 0 {
            1.0
        } else {
            self.chunks_finished as f64 / self.chunks_split as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = SnapshotStats::new();
        stats.record_chunks_split(4);
        stats.record_chunk_finished(10, 2);
        stats.record_chunk_finished(5, 0);
        stats.record_chunk_retry("chunk_read_error");
        stats.record_streaming_emitted(42);
        stats.record_streaming_emitted(40);
        stats.record_streaming_suppressed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks_split, 4);
        assert_eq!(snapshot.chunks_finished, 2);
        assert_eq!(snapshot.chunks_retried, 1);
        assert_eq!(snapshot.snapshot_rows, 15);
        assert_eq!(snapshot.window_events, 2);
        assert_eq!(snapshot.streaming_emitted, 2);
        assert_eq!(snapshot.streaming_suppressed, 1);
        assert_eq!(snapshot.streaming_position, 42);
        assert!((snapshot.chunk_progress() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_progress_without_chunks() {
        assert_eq!(SnapshotStatsSnapshot::default().chunk_progress(), 1.0);
    }
}
