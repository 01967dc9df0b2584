//! Per-stream throughput accounting and health counters.
//!
//! Counters are fed by the adapters and the synchronizer and exposed as
//! read-only snapshots; nothing here ever mutates the data path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Health counters for one elementary stream.
///
/// All fields use atomic operations for thread-safe access.
pub struct StreamHealth {
    /// Frames or records successfully processed
    pub processed: AtomicU64,

    /// Payload bytes processed
    pub bytes: AtomicU64,

    /// Frames dropped by backpressure or eviction
    pub drops: AtomicU64,

    /// KLV records rejected as malformed
    pub malformed: AtomicU64,

    /// Records carrying an unregistered schema key
    pub schema_mismatches: AtomicU64,

    /// Samples skipped because the buffer mapping failed
    pub map_failures: AtomicU64,

    /// Frame/metadata pairs matched by the synchronizer
    pub pairs_matched: AtomicU64,

    /// Timestamp (Unix microseconds) of the last processed frame
    pub last_frame_time: AtomicU64,
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            schema_mismatches: AtomicU64::new(0),
            map_failures: AtomicU64::new(0),
            pairs_matched: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(now_micros()),
        }
    }

    pub fn record_processed(&self, size: usize) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.last_frame_time.store(now_micros(), Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schema_mismatch(&self) {
        self.schema_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_map_failure(&self) {
        self.map_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pair(&self) {
        self.pairs_matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Check if the stream has stalled (no frames for the given duration)
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed = now_micros().saturating_sub(self.last_frame_time.load(Ordering::Relaxed));
        elapsed > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            processed: self.processed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            schema_mismatches: self.schema_mismatches.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
            pairs_matched: self.pairs_matched.load(Ordering::Relaxed),
        }
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one stream's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSummary {
    pub processed: u64,
    pub bytes: u64,
    pub drops: u64,
    pub malformed: u64,
    pub schema_mismatches: u64,
    pub map_failures: u64,
    pub pairs_matched: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} processed ({} bytes), {} drops, {} malformed, {} schema mismatches, {} map failures, {} pairs",
            self.processed,
            self.bytes,
            self.drops,
            self.malformed,
            self.schema_mismatches,
            self.map_failures,
            self.pairs_matched
        )
    }
}

/// Registry of per-stream health counters for one pipeline instance.
#[derive(Clone, Default)]
pub struct PipelineHealth {
    streams: Arc<Mutex<HashMap<String, Arc<StreamHealth>>>>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for the named stream, created on first use.
    pub fn stream(&self, name: &str) -> Arc<StreamHealth> {
        let mut streams = self.streams.lock().unwrap();
        Arc::clone(
            streams
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(StreamHealth::new())),
        )
    }

    /// Snapshot of every stream, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, HealthSummary)> {
        let streams = self.streams.lock().unwrap();
        let mut rows: Vec<(String, HealthSummary)> = streams
            .iter()
            .map(|(name, health)| (name.clone(), health.summary()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

/// Rolling throughput window, owned by a single adapter.
///
/// Counts events until at least `min_window` has elapsed, then yields the
/// rate and resets, matching one-second FPS accounting.
pub struct RateWindow {
    window_start: Instant,
    count: u64,
    min_window: Duration,
}

impl RateWindow {
    pub fn new(min_window: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            min_window,
        }
    }

    /// Count one event; returns the rate when a window closes.
    pub fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.min_window {
            let rate = self.count as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.count = 0;
            Some(rate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let health = StreamHealth::new();
        health.record_processed(1000);
        health.record_processed(2000);
        health.record_drop();
        health.record_malformed();
        health.record_pair();

        let summary = health.summary();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.bytes, 3000);
        assert_eq!(summary.drops, 1);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.pairs_matched, 1);
    }

    #[test]
    fn test_stall_detection() {
        let health = StreamHealth::new();
        health.record_processed(100);
        assert!(!health.is_stalled(Duration::from_secs(1)));

        std::thread::sleep(Duration::from_millis(120));
        assert!(health.is_stalled(Duration::from_millis(100)));
    }

    #[test]
    fn test_registry_reuses_streams() {
        let registry = PipelineHealth::new();
        registry.stream("video1").record_processed(10);
        registry.stream("video1").record_processed(10);
        registry.stream("klv").record_malformed();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "klv");
        assert_eq!(snapshot[1].1.processed, 2);
    }

    #[test]
    fn test_rate_window_resets() {
        let mut window = RateWindow::new(Duration::from_millis(50));
        assert_eq!(window.tick(), None);
        std::thread::sleep(Duration::from_millis(60));
        let rate = window.tick().expect("window should close");
        // Two events over ~60ms
        assert!(rate > 10.0 && rate < 60.0);
        assert_eq!(window.tick(), None);
    }
}
