//! Lightweight scan counters used for diagnostics.
//!
//! The `ScanMetrics` type exposes lock-free counters that track:
//! - Scans completed
//! - Spans detected (cumulative, post-merge)
//! - The chunk count of the last scan
//!
//! The snapshot is surfaced via HTTP (`GET /metrics`) to help validate the
//! chunking configuration and overall detection activity during development.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing detection activity.
///
/// The struct intentionally stays minimal—just atomic counters—so it can be
/// shared freely and queried without holding locks. The last chunk count is
/// exposed so dashboards can see when the chunked runner engages.
#[derive(Default)]
pub struct ScanMetrics {
    scans_completed: AtomicU64,
    spans_detected: AtomicU64,
    last_chunk_count: AtomicU64,
}

impl ScanMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed scan with its surviving span count and the number
    /// of chunks the input was split into.
    pub fn record_scan(&self, span_count: u64, chunk_count: u64) {
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
        self.spans_detected.fetch_add(span_count, Ordering::Relaxed);
        self.last_chunk_count.store(chunk_count, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> ScanMetricsSnapshot {
        ScanMetricsSnapshot {
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            spans_detected: self.spans_detected.load(Ordering::Relaxed),
            last_chunk_count: {
                let scans = self.scans_completed.load(Ordering::Relaxed);
                let last = self.last_chunk_count.load(Ordering::Relaxed);
                if scans == 0 || last == 0 { None } else { Some(last) }
            },
        }
    }
}

/// Immutable view of scan counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ScanMetricsSnapshot {
    /// Number of scans served since startup.
    pub scans_completed: u64,
    /// Total spans reported across all scans.
    pub spans_detected: u64,
    /// Chunk count of the most recent scan, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_scans_and_spans() {
        let metrics = ScanMetrics::new();
        metrics.record_scan(2, 1);
        metrics.record_scan(3, 4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.scans_completed, 2);
        assert_eq!(snapshot.spans_detected, 5);
        assert_eq!(snapshot.last_chunk_count, Some(4));
    }

    #[test]
    fn snapshot_is_consistent_when_empty() {
        let metrics = ScanMetrics::new();
        assert_eq!(metrics.snapshot().scans_completed, 0);
        assert_eq!(metrics.snapshot().spans_detected, 0);
        assert_eq!(metrics.snapshot().last_chunk_count, None);
    }
}
