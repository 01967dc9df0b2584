//! Frame source adapter for the receiver pipeline
//!
//! Drains decoded video samples delivered by the engine, copies them into
//! owned frames, converts channel ordering for the consumer, and enqueues
//! them on the bounded per-stream frame queue.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::engine::sample::{PixelFormat, Sample, SampleCaps};
use crate::error::StreamError;
use crate::pipeline::health::{RateWindow, StreamHealth};
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::VideoFrame;

/// Swap R and B channels in place (RGB ↔ BGR).
fn swap_channels(data: &mut [u8]) {
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

/// Adapter from engine video samples to owned frames on a bounded queue.
pub struct FrameSourceAdapter {
    stream: String,
    /// Channel ordering the consumer wants, converted on the fly
    consumer_format: PixelFormat,
    input_rx: Option<mpsc::Receiver<Sample>>,
    queue: Arc<FrameQueue<VideoFrame>>,
    health: Arc<StreamHealth>,
    rate: RateWindow,
}

impl FrameSourceAdapter {
    pub fn new(
        stream: impl Into<String>,
        consumer_format: PixelFormat,
        queue: Arc<FrameQueue<VideoFrame>>,
        health: Arc<StreamHealth>,
    ) -> Self {
        Self {
            stream: stream.into(),
            consumer_format,
            input_rx: None,
            queue,
            health,
            rate: RateWindow::new(Duration::from_secs(1)),
        }
    }

    /// Set the sample input channel
    pub fn set_input(&mut self, rx: mpsc::Receiver<Sample>) {
        self.input_rx = Some(rx);
    }

    /// Handle one sample: copy, convert, enqueue.
    ///
    /// Every error here is recoverable; the sample is skipped and counted.
    fn process_sample(&mut self, sample: Sample) {
        let SampleCaps::Video {
            width,
            height,
            format,
        } = sample.caps
        else {
            warn!("{}: non-video sample on video sink, skipping", self.stream);
            return;
        };

        // Copy out of engine-owned memory before the mapping is released.
        let mut data = match sample.map_read() {
            Ok(guard) => guard.to_vec(),
            Err(e) => {
                warn!("{}: {e}, skipping sample", self.stream);
                self.health.record_map_failure();
                return;
            }
        };

        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            warn!(
                "{}: buffer of {} bytes does not match caps {}x{} {}, skipping",
                self.stream,
                data.len(),
                width,
                height,
                format
            );
            self.health.record_map_failure();
            return;
        }

        if format != self.consumer_format {
            swap_channels(&mut data);
        }

        let size = data.len();
        let frame = VideoFrame {
            width,
            height,
            format: self.consumer_format,
            data,
            pts: sample.pts,
            arrived_at: Instant::now(),
            sequence: sample.sequence,
        };

        match self.queue.push(frame) {
            Ok(None) => self.health.record_processed(size),
            Ok(Some(_evicted)) => {
                // Made room by displacing the oldest queued frame.
                self.health.record_processed(size);
                self.health.record_drop();
            }
            Err(StreamError::QueueOverflow { .. }) => {
                self.health.record_drop();
            }
            Err(e) => {
                warn!("{}: enqueue failed: {e}", self.stream);
                self.health.record_drop();
            }
        }

        if let Some(fps) = self.rate.tick() {
            info!("{}: {:.2} fps", self.stream, fps);
        }
    }
}

#[async_trait]
impl PipelineStage for FrameSourceAdapter {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;

        info!("FrameSourceAdapter[{}]: started", self.stream);

        while let Some(sample) = input_rx.recv().await {
            self.process_sample(sample);
        }

        self.queue.close();
        info!(
            "FrameSourceAdapter[{}]: finished ({})",
            self.stream,
            self.health.summary()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FrameSourceAdapter"
    }
}
