//! Frame/metadata synchronization stage
//!
//! Frames and telemetry records arrive over independent notification paths
//! with no shared token, so pairing by callback order would be accidental.
//! Each telemetry record carries the monotonic trigger sequence (`trig_id`)
//! and frames carry the same tag when the transport propagates it; matching
//! is exact on that tag, with a nearest-arrival-time fallback for untagged
//! frames. Both pending tables are age- and capacity-bounded.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::klv::{ImageInfo, TelemetryRecord};
use crate::pipeline::health::StreamHealth;
use crate::pipeline::queue::FrameQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{PairedFrame, VideoFrame};

/// Configuration for frame/metadata pairing
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum arrival-time distance for the timestamp fallback match
    pub match_tolerance: Duration,
    /// Unmatched entries older than this are evicted
    pub entry_timeout: Duration,
    /// Maximum entries held per pending table
    pub max_pending: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            match_tolerance: Duration::from_millis(125), // half a frame at 4 fps
            entry_timeout: Duration::from_secs(2),
            max_pending: 64,
        }
    }
}

struct PendingFrame {
    frame: VideoFrame,
    arrived: Instant,
}

struct PendingMeta {
    info: ImageInfo,
    arrived: Instant,
}

/// The two bounded pending tables and the matching policy.
pub struct PairingTable {
    config: SyncConfig,
    frames: VecDeque<PendingFrame>,
    meta: VecDeque<PendingMeta>,
    pairs_matched: u64,
    frames_evicted: u64,
    meta_evicted: u64,
}

impl PairingTable {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            frames: VecDeque::with_capacity(config.max_pending),
            meta: VecDeque::with_capacity(config.max_pending),
            config,
            pairs_matched: 0,
            frames_evicted: 0,
            meta_evicted: 0,
        }
    }

    /// Offer a frame; returns a pair when a matching record is pending.
    pub fn push_frame(&mut self, frame: VideoFrame) -> Option<PairedFrame> {
        let arrived = frame.arrived_at;

        let matched = match frame.sequence {
            // Tagged frame: exact trigger-sequence match only.
            Some(seq) => self.meta.iter().position(|m| m.info.trig_id == seq),
            // Untagged: nearest arrival time within tolerance, FIFO tie-break.
            None => self.nearest_meta(arrived),
        };

        if let Some(index) = matched {
            let meta = self.meta.remove(index).unwrap();
            self.pairs_matched += 1;
            return Some(PairedFrame {
                frame,
                info: meta.info,
            });
        }

        self.frames.push_back(PendingFrame { frame, arrived });
        self.enforce_capacity();
        None
    }

    /// Offer a telemetry record; returns a pair when a matching frame is
    /// pending.
    pub fn push_meta(&mut self, info: ImageInfo) -> Option<PairedFrame> {
        self.push_meta_at(info, Instant::now())
    }

    fn push_meta_at(&mut self, info: ImageInfo, arrived: Instant) -> Option<PairedFrame> {
        let matched = self
            .frames
            .iter()
            .position(|f| f.frame.sequence == Some(info.trig_id))
            .or_else(|| self.nearest_untagged_frame(arrived));

        if let Some(index) = matched {
            let pending = self.frames.remove(index).unwrap();
            self.pairs_matched += 1;
            return Some(PairedFrame {
                frame: pending.frame,
                info,
            });
        }

        self.meta.push_back(PendingMeta { info, arrived });
        self.enforce_capacity();
        None
    }

    /// Drop entries older than the configured timeout.
    ///
    /// Returns (frames evicted, records evicted).
    pub fn evict_expired(&mut self, now: Instant) -> (u64, u64) {
        let timeout = self.config.entry_timeout;
        let mut frames = 0;
        while let Some(front) = self.frames.front() {
            if now.duration_since(front.arrived) > timeout {
                self.frames.pop_front();
                frames += 1;
            } else {
                break;
            }
        }
        let mut meta = 0;
        while let Some(front) = self.meta.front() {
            if now.duration_since(front.arrived) > timeout {
                self.meta.pop_front();
                meta += 1;
            } else {
                break;
            }
        }
        self.frames_evicted += frames;
        self.meta_evicted += meta;
        (frames, meta)
    }

    /// Index of the pending record closest in arrival time, within tolerance.
    fn nearest_meta(&self, arrived: Instant) -> Option<usize> {
        let mut best: Option<(usize, Duration)> = None;
        for (i, m) in self.meta.iter().enumerate() {
            let distance = abs_diff(arrived, m.arrived);
            if distance > self.config.match_tolerance {
                continue;
            }
            // Strict comparison keeps the earliest entry on ties (FIFO).
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((i, distance));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Index of the closest pending frame that carries no correlation tag.
    fn nearest_untagged_frame(&self, arrived: Instant) -> Option<usize> {
        let mut best: Option<(usize, Duration)> = None;
        for (i, f) in self.frames.iter().enumerate() {
            if f.frame.sequence.is_some() {
                continue;
            }
            let distance = abs_diff(arrived, f.arrived);
            if distance > self.config.match_tolerance {
                continue;
            }
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((i, distance));
            }
        }
        best.map(|(i, _)| i)
    }

    fn enforce_capacity(&mut self) {
        while self.frames.len() > self.config.max_pending {
            self.frames.pop_front();
            self.frames_evicted += 1;
        }
        while self.meta.len() > self.config.max_pending {
            self.meta.pop_front();
            self.meta_evicted += 1;
        }
    }

    /// Get statistics: (pairs, frames evicted, records evicted, pending frames, pending records)
    pub fn stats(&self) -> (u64, u64, u64, usize, usize) {
        (
            self.pairs_matched,
            self.frames_evicted,
            self.meta_evicted,
            self.frames.len(),
            self.meta.len(),
        )
    }
}

fn abs_diff(a: Instant, b: Instant) -> Duration {
    if a >= b { a - b } else { b - a }
}

/// Synchronization stage: polls the frame queue, drains the record channel,
/// and emits paired frames.
pub struct SyncStage {
    table: PairingTable,
    queue: Arc<FrameQueue<VideoFrame>>,
    health: Arc<StreamHealth>,
    meta_rx: Option<mpsc::Receiver<TelemetryRecord>>,
    output_tx: Option<mpsc::Sender<PairedFrame>>,
}

impl SyncStage {
    pub fn new(
        config: SyncConfig,
        queue: Arc<FrameQueue<VideoFrame>>,
        health: Arc<StreamHealth>,
    ) -> Self {
        Self {
            table: PairingTable::new(config),
            queue,
            health,
            meta_rx: None,
            output_tx: None,
        }
    }

    /// Set the decoded record input channel
    pub fn set_meta_input(&mut self, rx: mpsc::Receiver<TelemetryRecord>) {
        self.meta_rx = Some(rx);
    }

    /// Get the paired frame output channel
    pub fn take_output(&mut self) -> mpsc::Receiver<PairedFrame> {
        let (tx, rx) = mpsc::channel::<PairedFrame>(16);
        self.output_tx = Some(tx);
        rx
    }

    fn drain_frame_queue(&mut self, out: &mut Vec<PairedFrame>) {
        while let Some(frame) = self.queue.try_pop() {
            if let Some(pair) = self.table.push_frame(frame) {
                self.health.record_pair();
                out.push(pair);
            }
        }
    }
}

#[async_trait]
impl PipelineStage for SyncStage {
    async fn run(&mut self) -> Result<()> {
        let mut meta_rx = self
            .meta_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No metadata input channel"))?;
        let output_tx = self
            .output_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;

        info!("SyncStage: started");
        let poll_tick = Duration::from_millis(5);
        let mut last_stats_log = Instant::now();
        let mut meta_open = true;

        loop {
            let mut ready = Vec::new();

            tokio::select! {
                record = meta_rx.recv(), if meta_open => {
                    match record {
                        Some(TelemetryRecord::ImageInfo(item)) => {
                            if let Some(pair) = self.table.push_meta(item) {
                                self.health.record_pair();
                                ready.push(pair);
                            }
                        }
                        None => {
                            info!("SyncStage: metadata input closed");
                            meta_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep(poll_tick) => {}
            }

            self.drain_frame_queue(&mut ready);

            let (frames_evicted, meta_evicted) = self.table.evict_expired(Instant::now());
            if frames_evicted + meta_evicted > 0 {
                warn!(
                    "SyncStage: evicted {frames_evicted} frames, {meta_evicted} records past timeout"
                );
                for _ in 0..frames_evicted + meta_evicted {
                    self.health.record_drop();
                }
            }

            for pair in ready {
                if output_tx.send(pair).await.is_err() {
                    info!("SyncStage: output channel closed");
                    return Ok(());
                }
            }

            // Once metadata is gone and nothing is pending, downstream will
            // never see another pair.
            if !meta_open && self.queue.is_empty() {
                let (_, _, _, pending_frames, pending_meta) = self.table.stats();
                if pending_frames == 0 && pending_meta == 0 {
                    break;
                }
            }

            if last_stats_log.elapsed().as_secs() >= 30 {
                let (pairs, fe, me, pf, pm) = self.table.stats();
                info!(
                    "SyncStage: {pairs} paired, {fe}/{me} evicted, {pf}/{pm} pending"
                );
                last_stats_log = Instant::now();
            }
        }

        let (pairs, fe, me, _, _) = self.table.stats();
        info!("SyncStage: finished ({pairs} paired, {fe}/{me} evicted)");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SyncStage"
    }
}
