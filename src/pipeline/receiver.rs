//! Receiver coordinator: demuxes the container stream, adapts each sink into
//! the pipeline, pairs frames with their telemetry, and reports health.

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::engine::{GraphBuilder, GraphSpec, LinkType, NodeKind, StreamingEngine};
use crate::error::StreamError;
use crate::klv::SchemaRegistry;
use crate::pipeline::frame_source::FrameSourceAdapter;
use crate::pipeline::health::{PipelineHealth, RateWindow};
use crate::pipeline::lifecycle::LifecycleManager;
use crate::pipeline::meta_source::MetadataSourceAdapter;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::sync::{SyncConfig, SyncStage};
use crate::pipeline::types::{PairedFrame, VideoFrame};

/// Graph description for the receiving side.
///
/// One network source feeds the demux; each elementary stream gets its own
/// app sink.
pub fn receive_graph(config: &StreamConfig) -> Result<GraphSpec, StreamError> {
    let mut builder = GraphBuilder::new("receiver")
        .node("netsrc", NodeKind::Source)
        .prop("endpoint", config.endpoint.clone())
        .node("demux", NodeKind::Demux)
        .link("netsrc", "demux", LinkType::Container);
    for i in 1..=config.video_streams {
        builder = builder
            .node(format!("decode_{i}"), NodeKind::Filter)
            .node(format!("video{i}_sink"), NodeKind::Sink)
            .link("demux", format!("decode_{i}"), LinkType::Video)
            .link(format!("decode_{i}"), format!("video{i}_sink"), LinkType::Video);
    }
    builder
        .node("klv_sink", NodeKind::Sink)
        .link("demux", "klv_sink", LinkType::Metadata)
        .build()
}

/// Graph joining both sides in one process: app sources in, app sinks out,
/// mux and demux in the middle. Exercises the whole path without a network.
pub fn demo_graph(config: &StreamConfig) -> Result<GraphSpec, StreamError> {
    let mut builder = GraphBuilder::new("demo");
    for i in 1..=config.video_streams {
        builder = builder
            .node(format!("videosrc_{i}"), NodeKind::Source)
            .node(format!("video{i}_sink"), NodeKind::Sink)
            .link(format!("videosrc_{i}"), "mux", LinkType::Video)
            .link("demux", format!("video{i}_sink"), LinkType::Video);
    }
    builder
        .node("klvsrc", NodeKind::Source)
        .node("mux", NodeKind::Mux)
        .node("demux", NodeKind::Demux)
        .node("klv_sink", NodeKind::Sink)
        .link("klvsrc", "mux", LinkType::Metadata)
        .link("mux", "demux", LinkType::Container)
        .link("demux", "klv_sink", LinkType::Metadata)
        .build()
}

/// Owns the receiving pipeline, its adapter stages and the synchronizer.
pub struct ReceiverCoordinator {
    config: StreamConfig,
    manager: Arc<LifecycleManager>,
    health: PipelineHealth,
    stages: Vec<Box<dyn PipelineStage>>,
    /// Queues of video streams beyond the first; drained by a counting task
    extra_queues: Vec<Arc<FrameQueue<VideoFrame>>>,
    paired_rx: Option<mpsc::Receiver<PairedFrame>>,
}

impl ReceiverCoordinator {
    /// Wire every stage against the graph built from `config`.
    pub fn new(engine: &dyn StreamingEngine, config: StreamConfig) -> Result<Self> {
        let spec = receive_graph(&config)?;
        Self::with_graph(engine, config, &spec)
    }

    /// Same wiring against a caller-supplied graph (loopback demo).
    ///
    /// The graph must expose `video{i}_sink` nodes for each configured stream
    /// and a `klv_sink` node.
    pub fn with_graph(
        engine: &dyn StreamingEngine,
        config: StreamConfig,
        spec: &GraphSpec,
    ) -> Result<Self> {
        let manager = Arc::new(LifecycleManager::build(engine, spec)?);
        let health = PipelineHealth::new();
        let mut stages: Vec<Box<dyn PipelineStage>> = Vec::new();
        let mut queues = Vec::new();

        for i in 1..=config.video_streams {
            let stream = config.channel_name(i);
            let sink = format!("video{i}_sink");
            let rx = manager.connect_sink_channel(&sink, config.queue_capacity)?;
            let queue = Arc::new(FrameQueue::new(
                stream.clone(),
                config.queue_capacity,
                config.overflow_policy,
            ));
            let mut adapter = FrameSourceAdapter::new(
                stream.clone(),
                config.video.consumer_format,
                Arc::clone(&queue),
                health.stream(&stream),
            );
            adapter.set_input(rx);
            stages.push(Box::new(adapter));
            queues.push(queue);
        }

        let klv_rx = manager.connect_sink_channel("klv_sink", 64)?;
        let mut meta = MetadataSourceAdapter::new(
            "klv",
            SchemaRegistry::with_defaults(),
            health.stream("klv"),
        );
        meta.set_input(klv_rx);
        let meta_out = meta.take_output();
        stages.push(Box::new(meta));

        // Telemetry is paired against the primary stream; additional streams
        // are consumed by rate counters only.
        let mut sync = SyncStage::new(
            SyncConfig::default(),
            Arc::clone(&queues[0]),
            health.stream(&config.channel_name(1)),
        );
        sync.set_meta_input(meta_out);
        let paired_rx = sync.take_output();
        stages.push(Box::new(sync));

        Ok(Self {
            config,
            manager,
            health,
            stages,
            extra_queues: queues.split_off(1),
            paired_rx: Some(paired_rx),
        })
    }

    /// Handle for pushing samples in loopback mode.
    pub fn manager(&self) -> Arc<LifecycleManager> {
        Arc::clone(&self.manager)
    }

    pub fn health(&self) -> &PipelineHealth {
        &self.health
    }

    /// Take over the paired-frame output.
    ///
    /// When taken before `run`, the built-in display consumer is disabled and
    /// the caller owns delivery.
    pub fn take_paired_output(&mut self) -> Option<mpsc::Receiver<PairedFrame>> {
        self.paired_rx.take()
    }

    fn spawn_stages(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for mut stage in self.stages.drain(..) {
            handles.push(tokio::spawn(async move {
                let name = stage.name();
                if let Err(e) = stage.run().await {
                    warn!("{name}: stage failed: {e}");
                }
            }));
        }
        // Secondary streams: pull and count, so their queues never sit full.
        for queue in self.extra_queues.drain(..) {
            handles.push(tokio::task::spawn_blocking(move || {
                let mut rate = RateWindow::new(Duration::from_secs(1));
                loop {
                    match queue.pop_timeout(Duration::from_millis(200)) {
                        Some(frame) => {
                            if let Some(fps) = rate.tick() {
                                info!(
                                    "{}x{} secondary stream at {fps:.2} fps",
                                    frame.width, frame.height
                                );
                            }
                        }
                        None if queue.is_closed() => break,
                        None => {}
                    }
                }
            }));
        }
        handles
    }

    /// Play the pipeline and consume until cancelled or the engine fails.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.manager.ready()?;
        self.manager.play()?;
        info!(
            "receiving {} video stream(s) from {}",
            self.config.video_streams, self.config.endpoint
        );

        let bus_manager = Arc::clone(&self.manager);
        let bus_shutdown = shutdown.clone();
        let bus = thread::spawn(move || {
            let result = bus_manager.run_bus(&bus_shutdown);
            bus_shutdown.cancel();
            result
        });

        let handles = self.spawn_stages();
        let mut report = tokio::time::interval(Duration::from_secs(10));
        report.tick().await; // the first tick is immediate

        match self.paired_rx.take() {
            Some(mut paired_rx) => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    pair = paired_rx.recv() => match pair {
                        Some(pair) => self.display(&pair),
                        None => break,
                    },
                    _ = report.tick() => self.report(),
                }
            },
            None => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = report.tick() => self.report(),
                }
            },
        }

        shutdown.cancel();
        // Stopping the engine drops its sink handlers; every stage then sees
        // its input close and finishes on its own.
        self.manager.stop()?;
        for handle in handles {
            let _ = handle.await;
        }
        let bus_result = bus
            .join()
            .unwrap_or_else(|_| Err(StreamError::Pipeline("bus thread panicked".into())));

        self.report();
        if let Err(e) = bus_result {
            warn!("pipeline ended with engine error: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    fn display(&self, pair: &PairedFrame) {
        if !self.config.display {
            return;
        }
        info!(
            "paired trig={} {}x{} {} gain={:.2} latency={:?} file={}",
            pair.info.trig_id,
            pair.frame.width,
            pair.frame.height,
            pair.frame.format,
            pair.info.gain,
            pair.frame.arrived_at.elapsed(),
            pair.info.filename,
        );
    }

    fn report(&self) {
        for (name, summary) in self.health.snapshot() {
            info!("{name}: {summary}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::sample::{PixelFormat, Sample};
    use crate::klv::ImageInfo;
    use crate::pipeline::state::PipelineState;
    use crate::pipeline::types::Timestamp;

    fn config() -> StreamConfig {
        StreamConfig {
            video_streams: 1,
            video: crate::config::VideoConfig {
                width: 2,
                height: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn loopback_graph() -> GraphSpec {
        demo_graph(&config()).unwrap()
    }

    #[test]
    fn test_receive_graph_builds() {
        let mut config = config();
        config.video_streams = 2;
        let spec = receive_graph(&config).unwrap();
        assert!(spec.node("video1_sink").is_some());
        assert!(spec.node("video2_sink").is_some());
        assert_eq!(
            spec.sinks_reachable_from("netsrc"),
            vec!["klv_sink", "video1_sink", "video2_sink"]
        );
    }

    #[tokio::test]
    async fn test_end_to_end_pairing_over_loopback() {
        let mut coordinator =
            ReceiverCoordinator::with_graph(&LoopbackEngine, config(), &loopback_graph()).unwrap();
        let mut paired = coordinator.take_paired_output().unwrap();
        let manager = coordinator.manager();
        let shutdown = CancellationToken::new();

        let run_shutdown = shutdown.clone();
        let runner = tokio::spawn(async move { coordinator.run(run_shutdown).await });

        while !manager.state().is_playing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // One tagged frame and its telemetry record, in either push order.
        let info = ImageInfo {
            trig_id: 42,
            device_id: "HYDRO-LRR".into(),
            channel: "lrr1".into(),
            filename: "lrr1_000042.jpg".into(),
            session_name: "session1".into(),
            gain: 1.0,
        };
        let wire = info.to_klv().unwrap().encode().unwrap();
        manager
            .push_sample("klvsrc", Sample::metadata(wire, Timestamp::from_micros(0), Some(42)))
            .unwrap();
        manager
            .push_sample(
                "videosrc_1",
                Sample::video(
                    vec![9u8; 12],
                    2,
                    2,
                    PixelFormat::Rgb,
                    Timestamp::from_micros(0),
                    Some(42),
                ),
            )
            .unwrap();

        let pair = tokio::time::timeout(Duration::from_secs(5), paired.recv())
            .await
            .expect("pairing timed out")
            .expect("pair expected");
        assert_eq!(pair.info.trig_id, 42);
        assert_eq!(pair.info.device_id, "HYDRO-LRR");
        assert_eq!(pair.info.gain, 1.0);
        assert_eq!(pair.frame.sequence, Some(42));
        assert_eq!(pair.frame.format, PixelFormat::Bgr);

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(manager.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_run_stops_cleanly_on_cancel() {
        let mut coordinator =
            ReceiverCoordinator::with_graph(&LoopbackEngine, config(), &loopback_graph()).unwrap();
        let manager = coordinator.manager();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        coordinator.run(shutdown).await.unwrap();
        assert_eq!(manager.state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn test_engine_error_surfaces_from_run() {
        let pipeline =
            crate::engine::loopback::LoopbackPipeline::new(&loopback_graph()).unwrap();
        // Inject before running so the bus loop sees it immediately.
        pipeline.inject_error("simulated demux failure");

        // Wire the coordinator around the same shared pipeline instance.
        struct Fixed(crate::engine::loopback::LoopbackPipeline);
        impl StreamingEngine for Fixed {
            fn build(
                &self,
                _spec: &GraphSpec,
            ) -> Result<Box<dyn crate::engine::EnginePipeline>, StreamError> {
                Ok(Box::new(self.0.clone()))
            }
        }

        let mut coordinator =
            ReceiverCoordinator::with_graph(&Fixed(pipeline), config(), &loopback_graph())
                .unwrap();
        let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("simulated demux failure"));
    }
}
