//! KLV record encoding and decoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::StreamError;

/// Size of the fixed schema key.
pub const KEY_LEN: usize = 16;

/// Size of the full KLV header (key + big-endian u32 length).
pub const HEADER_LEN: usize = KEY_LEN + 4;

/// One framed metadata record.
///
/// The key is not self-describing: the decoder must know the key→schema
/// mapping a priori (see `telemetry::SchemaRegistry`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlvRecord {
    pub key: [u8; KEY_LEN],
    pub payload: Bytes,
}

impl KlvRecord {
    pub fn new(key: [u8; KEY_LEN], payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    /// Encode to wire bytes: `key:16 || length:4 BE || payload`.
    pub fn encode(&self) -> Result<Bytes, StreamError> {
        let len = u32::try_from(self.payload.len()).map_err(|_| {
            StreamError::MalformedFrame(format!(
                "payload of {} bytes exceeds the u32 length field",
                self.payload.len()
            ))
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_slice(&self.key);
        buf.put_u32(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode one record from a demuxed buffer.
    ///
    /// The declared length is bounds-checked against the actual buffer before
    /// any slicing; a length field pointing past the end of the buffer is
    /// rejected, never trusted. One buffer carries exactly one record, so
    /// trailing bytes beyond the declared length are also malformed.
    pub fn decode(buf: &[u8]) -> Result<KlvRecord, StreamError> {
        if buf.len() < HEADER_LEN {
            return Err(StreamError::MalformedFrame(format!(
                "buffer of {} bytes is shorter than the {HEADER_LEN}-byte header",
                buf.len()
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[..KEY_LEN]);

        let declared = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        let remaining = buf.len() - HEADER_LEN;
        if declared > remaining {
            return Err(StreamError::MalformedFrame(format!(
                "declared length {declared} exceeds {remaining} remaining bytes"
            )));
        }
        if declared < remaining {
            return Err(StreamError::MalformedFrame(format!(
                "{} trailing bytes after declared length {declared}",
                remaining - declared
            )));
        }

        Ok(KlvRecord {
            key,
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + declared]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0xf9, 0xca, 0x79, 0x6d, 0x04, 0x1c, 0xb2, 0x79, 0xe9, 0xaa, 0x74, 0x43, 0x63, 0xcf, 0x3a,
        0x39,
    ];

    #[test]
    fn test_encode_layout() {
        let record = KlvRecord::new(KEY, vec![7u8; 25]);
        let wire = record.encode().unwrap();

        assert_eq!(wire.len(), 45);
        assert_eq!(&wire[..16], &KEY);
        assert_eq!(u32::from_be_bytes([wire[16], wire[17], wire[18], wire[19]]), 25);
        assert_eq!(&wire[20..], &[7u8; 25][..]);
    }

    #[test]
    fn test_round_trip() {
        let record = KlvRecord::new(KEY, b"opaque schema bytes".to_vec());
        let decoded = KlvRecord::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let record = KlvRecord::new(KEY, Vec::new());
        let wire = record.encode().unwrap();
        assert_eq!(wire.len(), HEADER_LEN);
        assert_eq!(KlvRecord::decode(&wire).unwrap(), record);
    }

    #[test]
    fn test_short_buffers_rejected() {
        // Every buffer shorter than the header must fail, regardless of content.
        for len in 0..HEADER_LEN {
            let buf = vec![0xffu8; len];
            assert!(
                matches!(
                    KlvRecord::decode(&buf),
                    Err(StreamError::MalformedFrame(_))
                ),
                "buffer of {len} bytes was accepted"
            );
        }
    }

    #[test]
    fn test_overlong_declared_length_rejected() {
        // Any length field greater than the remaining bytes must fail without
        // reading out of bounds.
        for payload_len in [0usize, 1, 8, 64] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&KEY);
            for excess in [1u32, 2, 100, u32::MAX - payload_len as u32] {
                let mut wire = buf.clone();
                wire.extend_from_slice(&(payload_len as u32 + excess).to_be_bytes());
                wire.extend_from_slice(&vec![0u8; payload_len]);
                assert!(matches!(
                    KlvRecord::decode(&wire),
                    Err(StreamError::MalformedFrame(_))
                ));
            }
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut wire = KlvRecord::new(KEY, vec![1, 2, 3]).encode().unwrap().to_vec();
        wire.push(0);
        assert!(matches!(
            KlvRecord::decode(&wire),
            Err(StreamError::MalformedFrame(_))
        ));
    }
}
