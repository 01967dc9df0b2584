//! KLV metadata framing and telemetry schemas
//!
//! The private metadata stream carries self-delimiting KLV records:
//! a fixed 16-byte schema key, a 4-byte big-endian payload length, then the
//! payload itself. The codec only frames and dispatches; payload encoding is
//! owned by the schema layer.

pub mod codec;
pub mod telemetry;

pub use codec::{HEADER_LEN, KEY_LEN, KlvRecord};
pub use telemetry::{IMAGE_INFO_KEY, ImageInfo, SchemaRegistry, TelemetryRecord};
