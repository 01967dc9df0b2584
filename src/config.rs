//! Application configuration and defaults.

use std::time::Duration;

use crate::engine::sample::PixelFormat;
use crate::pipeline::queue::OverflowPolicy;

pub fn app_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Geometry and rate of the generated video streams.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Channel ordering the consumer side wants its frames in
    pub consumer_format: PixelFormat,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 4.0,
            consumer_format: PixelFormat::Bgr,
        }
    }
}

/// Identity fields stamped into every generated telemetry record.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub device_id: String,
    /// Per-stream channel names are formed as `{channel_prefix}{index}`
    pub channel_prefix: String,
    pub session_name: String,
    pub gain: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_id: "HYDRO-LRR".to_string(),
            channel_prefix: "lrr".to_string(),
            session_name: "session1".to_string(),
            gain: 1.0,
        }
    }
}

/// Everything one sender or receiver instance needs.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Transport endpoint, `host:port`
    pub endpoint: String,
    /// Number of parallel video streams in the container
    pub video_streams: usize,
    pub video: VideoConfig,
    pub telemetry: TelemetryConfig,
    /// Capacity of each per-stream frame queue
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Log each paired frame on the receiver
    pub display: bool,
}

impl StreamConfig {
    /// Interval between generated frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.video.fps.max(0.001))
    }

    /// Channel name of the 1-based video stream index.
    pub fn channel_name(&self, index: usize) -> String {
        format!("{}{index}", self.telemetry.channel_prefix)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:5000".to_string(),
            video_streams: 1,
            video: VideoConfig::default(),
            telemetry: TelemetryConfig::default(),
            queue_capacity: 8,
            overflow_policy: OverflowPolicy::DropOldest,
            display: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_interval_from_fps() {
        let config = StreamConfig::default();
        assert_eq!(config.frame_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_channel_names_are_indexed() {
        let config = StreamConfig::default();
        assert_eq!(config.channel_name(1), "lrr1");
        assert_eq!(config.channel_name(2), "lrr2");
    }
}
