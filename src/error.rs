//! Error kinds shared across the streaming core.
//!
//! Recoverable kinds are handled at the adapter boundary (drop the offending
//! sample, count it, keep going). Fatal kinds surface through the lifecycle
//! manager as a terminal pipeline state.

use thiserror::Error;

/// Errors raised by the streaming core.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Connection lost or refused. Fatal for the affected pipeline instance.
    #[error("transport failure: {0}")]
    Transport(String),

    /// KLV header or length field inconsistent with the actual buffer.
    #[error("malformed KLV frame: {0}")]
    MalformedFrame(String),

    /// Decoded record carries a key with no registered schema.
    #[error("unrecognized schema key {}", hex16(.0))]
    SchemaMismatch([u8; 16]),

    /// Consumer slower than producer and the overflow policy rejected a frame.
    #[error("queue overflow on stream '{stream}'")]
    QueueOverflow { stream: String },

    /// Failed buffer mapping. Skip that sample only.
    #[error("resource error: {0}")]
    Resource(String),

    /// Terminal failure reported by the engine or the lifecycle manager.
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

impl StreamError {
    /// Fatal errors terminate the pipeline instance; everything else is
    /// handled where it occurs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Transport(_) | StreamError::Pipeline(_))
    }
}

fn hex16(key: &[u8; 16]) -> String {
    key.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_split() {
        assert!(StreamError::Transport("refused".into()).is_fatal());
        assert!(StreamError::Pipeline("bus error".into()).is_fatal());
        assert!(!StreamError::MalformedFrame("short".into()).is_fatal());
        assert!(!StreamError::SchemaMismatch([0; 16]).is_fatal());
        assert!(
            !StreamError::QueueOverflow {
                stream: "video1".into()
            }
            .is_fatal()
        );
        assert!(!StreamError::Resource("map failed".into()).is_fatal());
    }

    #[test]
    fn test_schema_mismatch_display() {
        let err = StreamError::SchemaMismatch([0xab; 16]);
        assert!(err.to_string().contains(&"ab".repeat(16)));
    }
}
