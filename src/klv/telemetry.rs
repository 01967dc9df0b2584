//! Telemetry payload schemas and key-based dispatch.
//!
//! Payload bytes are opaque to the KLV codec; this layer owns the mapping
//! from schema key to concrete record type. Keys are agreed out of band
//! (MD5 digest of the schema name) and are not self-describing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::klv::codec::KlvRecord;

/// Schema key for [`ImageInfo`]: MD5 of `"ImageInfo"`.
pub const IMAGE_INFO_KEY: [u8; 16] = [
    0xf9, 0xca, 0x79, 0x6d, 0x04, 0x1c, 0xb2, 0x79, 0xe9, 0xaa, 0x74, 0x43, 0x63, 0xcf, 0x3a, 0x39,
];

/// Per-frame acquisition telemetry.
///
/// `trig_id` is the monotonic trigger sequence; it doubles as the correlation
/// tag that pairs a record with the frame captured at the same instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    pub trig_id: u64,
    pub device_id: String,
    pub channel: String,
    pub filename: String,
    pub session_name: String,
    pub gain: f64,
}

impl ImageInfo {
    /// Serialize and frame as a KLV record.
    pub fn to_klv(&self) -> Result<KlvRecord, StreamError> {
        let payload = bincode::serialize(self)
            .map_err(|e| StreamError::MalformedFrame(format!("serialize ImageInfo: {e}")))?;
        Ok(KlvRecord::new(IMAGE_INFO_KEY, payload))
    }

    /// Deserialize from raw payload bytes (the V of a KLV record).
    pub fn from_payload(payload: &[u8]) -> Result<Self, StreamError> {
        bincode::deserialize(payload)
            .map_err(|e| StreamError::MalformedFrame(format!("deserialize ImageInfo: {e}")))
    }
}

/// A decoded telemetry record of any registered schema.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    ImageInfo(ImageInfo),
}

impl TelemetryRecord {
    /// Correlation tag carried by the record, if the schema defines one.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            TelemetryRecord::ImageInfo(info) => Some(info.trig_id),
        }
    }
}

type SchemaDecoder = fn(&[u8]) -> Result<TelemetryRecord, StreamError>;

/// Key → schema decoder table.
pub struct SchemaRegistry {
    decoders: HashMap<[u8; 16], SchemaDecoder>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registry with every schema this crate knows about.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(IMAGE_INFO_KEY, |payload| {
            ImageInfo::from_payload(payload).map(TelemetryRecord::ImageInfo)
        });
        registry
    }

    pub fn register(&mut self, key: [u8; 16], decoder: SchemaDecoder) {
        self.decoders.insert(key, decoder);
    }

    /// Dispatch a framed record to its schema decoder.
    ///
    /// An unknown key is a `SchemaMismatch`; callers drop the record and
    /// continue.
    pub fn decode(&self, record: &KlvRecord) -> Result<TelemetryRecord, StreamError> {
        match self.decoders.get(&record.key) {
            Some(decoder) => decoder(&record.payload),
            None => Err(StreamError::SchemaMismatch(record.key)),
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
