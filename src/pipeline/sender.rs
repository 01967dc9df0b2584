//! Sender coordinator: generated video plus per-frame telemetry, multiplexed
//! into one container stream.
//!
//! Every video stream is a generated ball pattern; each frame push is
//! followed by a KLV record carrying the same trigger sequence, so the
//! receiver can pair them regardless of mux interleaving.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::engine::sample::{PixelFormat, Sample};
use crate::engine::{GraphBuilder, GraphSpec, LinkType, NodeKind, StreamingEngine};
use crate::error::StreamError;
use crate::klv::ImageInfo;
use crate::pipeline::health::{PipelineHealth, RateWindow};
use crate::pipeline::lifecycle::LifecycleManager;
use crate::pipeline::testsrc::BallPattern;
use crate::pipeline::types::Timestamp;

/// Graph description for the sending side.
///
/// Per stream: app source, colorspace conversion, encode. All elementary
/// streams meet in one mux feeding the network sink.
pub fn send_graph(config: &StreamConfig) -> Result<GraphSpec, StreamError> {
    let mut builder = GraphBuilder::new("sender");
    for i in 1..=config.video_streams {
        builder = builder
            .node(format!("videosrc_{i}"), NodeKind::Source)
            .prop("width", config.video.width.to_string())
            .prop("height", config.video.height.to_string())
            .prop("fps", config.video.fps.to_string())
            .node(format!("convert_{i}"), NodeKind::Filter)
            .node(format!("encode_{i}"), NodeKind::Filter)
            .link(format!("videosrc_{i}"), format!("convert_{i}"), LinkType::Video)
            .link(format!("convert_{i}"), format!("encode_{i}"), LinkType::Video)
            .link(format!("encode_{i}"), "mux", LinkType::Video);
    }
    builder
        .node("klvsrc", NodeKind::Source)
        .node("mux", NodeKind::Mux)
        .node("netsink", NodeKind::Sink)
        .prop("endpoint", config.endpoint.clone())
        .link("klvsrc", "mux", LinkType::Metadata)
        .link("mux", "netsink", LinkType::Container)
        .build()
}

/// Feed generated frames and their telemetry into a playing pipeline until
/// cancelled.
pub async fn generate(
    manager: &LifecycleManager,
    config: &StreamConfig,
    health: &PipelineHealth,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut patterns: Vec<BallPattern> = (0..config.video_streams)
        .map(|_| BallPattern::new(config.video.width, config.video.height))
        .collect();
    let mut rates: Vec<RateWindow> = (0..config.video_streams)
        .map(|_| RateWindow::new(std::time::Duration::from_secs(1)))
        .collect();

    let frame_interval = config.frame_interval();
    let mut interval = tokio::time::interval(frame_interval);
    let mut trig_id: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        for (i, pattern) in patterns.iter_mut().enumerate() {
            let stream_index = i + 1;
            let source = format!("videosrc_{stream_index}");
            let channel = config.channel_name(stream_index);
            let pts = Timestamp::from_duration(frame_interval.mul_f64(pattern.frame_index() as f64));

            let data = pattern.next_frame();
            let size = data.len();
            let sample = Sample::video(
                data,
                config.video.width,
                config.video.height,
                PixelFormat::Rgb,
                pts,
                Some(trig_id),
            );
            if let Err(e) = manager.push_sample(&source, sample) {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                return Err(e).with_context(|| format!("push frame into {source}"));
            }
            health.stream(&channel).record_processed(size);

            let info = ImageInfo {
                trig_id,
                device_id: config.telemetry.device_id.clone(),
                channel: channel.clone(),
                filename: format!("{channel}_{trig_id:06}.jpg"),
                session_name: config.telemetry.session_name.clone(),
                gain: config.telemetry.gain,
            };
            let wire = info.to_klv()?.encode()?;
            let record_size = wire.len();
            let sample = Sample::metadata(wire, pts, Some(trig_id));
            if let Err(e) = manager.push_sample("klvsrc", sample) {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                return Err(e).context("push telemetry record");
            }
            health.stream("klv").record_processed(record_size);

            if let Some(fps) = rates[i].tick() {
                info!("{channel}: generating {fps:.2} fps");
            }
            trig_id += 1;
        }
    }

    info!("generator stopped after {trig_id} triggers");
    Ok(())
}

/// Owns the sending pipeline and its generator loop.
pub struct SenderCoordinator {
    config: StreamConfig,
    manager: Arc<LifecycleManager>,
    health: PipelineHealth,
}

impl SenderCoordinator {
    pub fn new(engine: &dyn StreamingEngine, config: StreamConfig) -> Result<Self> {
        let spec = send_graph(&config)?;
        let manager = Arc::new(LifecycleManager::build(engine, &spec)?);
        Ok(Self {
            config,
            manager,
            health: PipelineHealth::new(),
        })
    }

    pub fn health(&self) -> &PipelineHealth {
        &self.health
    }

    /// Play the pipeline and generate until cancelled or the engine fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.manager.ready()?;
        self.manager.play()?;
        info!(
            "sending {} video stream(s) to {}",
            self.config.video_streams, self.config.endpoint
        );

        let bus_manager = Arc::clone(&self.manager);
        let bus_shutdown = shutdown.clone();
        let bus = thread::spawn(move || {
            let result = bus_manager.run_bus(&bus_shutdown);
            // A fatal bus event also ends the generator loop.
            bus_shutdown.cancel();
            result
        });

        let generated = generate(&self.manager, &self.config, &self.health, &shutdown).await;

        shutdown.cancel();
        self.manager.stop()?;
        let bus_result = bus.join().unwrap_or_else(|_| {
            Err(StreamError::Pipeline("bus thread panicked".into()))
        });

        for (name, summary) in self.health.snapshot() {
            info!("{name}: {summary}");
        }

        generated?;
        if let Err(e) = bus_result {
            warn!("pipeline ended with engine error: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}
