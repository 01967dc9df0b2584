//! Core types for the pipeline system

use std::time::{Duration, Instant};

use crate::engine::sample::PixelFormat;
use crate::klv::ImageInfo;

/// Timestamp representation for media frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Microseconds since pipeline start
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from duration since epoch
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Create a timestamp from instant relative to base
    pub fn from_instant(instant: Instant, base: Instant) -> Self {
        let duration = instant.saturating_duration_since(base);
        Self::from_duration(duration)
    }

    /// Convert to duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_micros(self.micros.max(0) as u64)
    }

    /// Absolute difference between two timestamps
    pub fn diff(&self, other: Timestamp) -> Duration {
        let diff_micros = (self.micros - other.micros).abs();
        Duration::from_micros(diff_micros as u64)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// A decoded video frame owned by the pipeline.
///
/// The pixel buffer is always a copy made inside the sample callback, before
/// the engine mapping is released; it never aliases engine-owned memory.
#[derive(Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,

    /// Capture timestamp propagated through the transport
    pub pts: Timestamp,

    /// When the adapter received this frame
    pub arrived_at: Instant,

    /// Correlation tag matching the telemetry trigger sequence, when the
    /// transport propagates one
    pub sequence: Option<u64>,
}

impl VideoFrame {
    /// Size of the pixel buffer in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("pts", &self.pts)
            .field("sequence", &self.sequence)
            .field("size", &self.size())
            .finish()
    }
}

/// A video frame joined with the telemetry record describing the same
/// captured instant.
#[derive(Debug, Clone)]
pub struct PairedFrame {
    pub frame: VideoFrame,
    pub info: ImageInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_diff_is_symmetric() {
        let a = Timestamp::from_micros(1_000);
        let b = Timestamp::from_micros(4_500);
        assert_eq!(a.diff(b), Duration::from_micros(3_500));
        assert_eq!(b.diff(a), Duration::from_micros(3_500));
    }

    #[test]
    fn test_timestamp_from_instant_saturates() {
        let base = Instant::now();
        let ts = Timestamp::from_instant(base, base + Duration::from_secs(1));
        assert_eq!(ts.micros, 0);
    }
}
