//! Metadata source adapter for the receiver pipeline
//!
//! Drains raw KLV buffers from the engine's metadata sink, decodes and
//! dispatches them by schema key, and forwards the decoded records to the
//! synchronizer. A malformed or unrecognized record is logged and dropped;
//! it never halts the adapter.

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::engine::sample::Sample;
use crate::error::StreamError;
use crate::klv::{KlvRecord, SchemaRegistry, TelemetryRecord};
use crate::pipeline::health::{RateWindow, StreamHealth};
use crate::pipeline::stage::PipelineStage;

/// Adapter from raw metadata buffers to decoded telemetry records.
pub struct MetadataSourceAdapter {
    stream: String,
    registry: SchemaRegistry,
    input_rx: Option<mpsc::Receiver<Sample>>,
    output_tx: Option<mpsc::Sender<TelemetryRecord>>,
    health: Arc<StreamHealth>,
    rate: RateWindow,
}

impl MetadataSourceAdapter {
    pub fn new(stream: impl Into<String>, registry: SchemaRegistry, health: Arc<StreamHealth>) -> Self {
        Self {
            stream: stream.into(),
            registry,
            input_rx: None,
            output_tx: None,
            health,
            rate: RateWindow::new(Duration::from_secs(1)),
        }
    }

    /// Set the sample input channel
    pub fn set_input(&mut self, rx: mpsc::Receiver<Sample>) {
        self.input_rx = Some(rx);
    }

    /// Get the decoded record output channel
    pub fn take_output(&mut self) -> mpsc::Receiver<TelemetryRecord> {
        let (tx, rx) = mpsc::channel::<TelemetryRecord>(64);
        self.output_tx = Some(tx);
        rx
    }

    /// Decode one sample; recoverable failures are counted and dropped.
    fn decode_sample(&mut self, sample: &Sample) -> Option<TelemetryRecord> {
        let raw = match sample.map_read() {
            Ok(guard) => guard.to_vec(),
            Err(e) => {
                warn!("{}: {e}, skipping record", self.stream);
                self.health.record_map_failure();
                return None;
            }
        };

        let record = match KlvRecord::decode(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("{}: {e}, dropping record", self.stream);
                self.health.record_malformed();
                return None;
            }
        };

        match self.registry.decode(&record) {
            Ok(decoded) => {
                self.health.record_processed(raw.len());
                if let Some(rate) = self.rate.tick() {
                    info!("{}: {:.2} records/s", self.stream, rate);
                }
                Some(decoded)
            }
            Err(StreamError::SchemaMismatch(_)) => {
                warn!("{}: unrecognized schema key, dropping record", self.stream);
                self.health.record_schema_mismatch();
                None
            }
            Err(e) => {
                warn!("{}: {e}, dropping record", self.stream);
                self.health.record_malformed();
                None
            }
        }
    }
}

#[async_trait]
impl PipelineStage for MetadataSourceAdapter {
    async fn run(&mut self) -> Result<()> {
        let mut input_rx = self
            .input_rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No input channel"))?;
        let output_tx = self
            .output_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;

        info!("MetadataSourceAdapter[{}]: started", self.stream);

        while let Some(sample) = input_rx.recv().await {
            if let Some(record) = self.decode_sample(&sample)
                && output_tx.send(record).await.is_err()
            {
                info!("MetadataSourceAdapter[{}]: output closed", self.stream);
                break;
            }
        }

        info!(
            "MetadataSourceAdapter[{}]: finished ({})",
            self.stream,
            self.health.summary()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MetadataSourceAdapter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klv::ImageInfo;
    use crate::pipeline::types::Timestamp;

    fn adapter() -> MetadataSourceAdapter {
        MetadataSourceAdapter::new(
            "klv",
            SchemaRegistry::with_defaults(),
            Arc::new(StreamHealth::new()),
        )
    }

    fn info_sample(trig_id: u64) -> Sample {
        let record = ImageInfo {
            trig_id,
            device_id: "HYDRO-LRR".into(),
            channel: "lrr1".into(),
            filename: "f.jpg".into(),
            session_name: "s1".into(),
            gain: 1.0,
        }
        .to_klv()
        .unwrap();
        Sample::metadata(
            record.encode().unwrap(),
            Timestamp::from_micros(trig_id as i64),
            Some(trig_id),
        )
    }

    #[test]
    fn test_decodes_and_dispatches() {
        let mut adapter = adapter();
        let record = adapter.decode_sample(&info_sample(42)).unwrap();
        match record {
            TelemetryRecord::ImageInfo(info) => {
                assert_eq!(info.trig_id, 42);
                assert_eq!(info.device_id, "HYDRO-LRR");
            }
        }
    }

    #[test]
    fn test_malformed_record_dropped_not_fatal() {
        let mut adapter = adapter();
        let sample = Sample::metadata(vec![0u8; 7], Timestamp::from_micros(0), None);
        assert!(adapter.decode_sample(&sample).is_none());
        assert_eq!(adapter.health.summary().malformed, 1);

        // The adapter keeps going afterwards.
        assert!(adapter.decode_sample(&info_sample(1)).is_some());
    }

    #[test]
    fn test_unknown_key_dropped() {
        let mut adapter = adapter();
        let record = KlvRecord::new([0x55; 16], b"payload".to_vec());
        let sample = Sample::metadata(
            record.encode().unwrap(),
            Timestamp::from_micros(0),
            None,
        );
        assert!(adapter.decode_sample(&sample).is_none());
        assert_eq!(adapter.health.summary().schema_mismatches, 1);
    }

    #[tokio::test]
    async fn test_run_forwards_records_in_order() {
        let mut adapter = adapter();
        let (tx, rx) = mpsc::channel(16);
        adapter.set_input(rx);
        let mut out = adapter.take_output();

        for trig in 0..4u64 {
            tx.send(info_sample(trig)).await.unwrap();
        }
        drop(tx);
        adapter.run().await.unwrap();

        let mut seen = Vec::new();
        while let Some(TelemetryRecord::ImageInfo(info)) = out.recv().await {
            seen.push(info.trig_id);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
