//! Samples and capability metadata exchanged with the engine.

use bytes::Bytes;

use crate::error::StreamError;
use crate::pipeline::types::Timestamp;

/// Pixel channel ordering of a raw video buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Bgr,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        3
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Rgb => write!(f, "RGB"),
            PixelFormat::Bgr => write!(f, "BGR"),
        }
    }
}

/// Capability metadata attached to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleCaps {
    Video {
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    /// Private data stream (KLV records)
    Metadata,
}

/// One buffer handed across the engine boundary, with its caps.
///
/// The buffer behind a sample belongs to the engine; consumers must go
/// through [`Sample::map_read`] and copy what they need before the guard is
/// dropped.
#[derive(Debug, Clone)]
pub struct Sample {
    data: Bytes,
    mappable: bool,
    pub caps: SampleCaps,
    pub pts: Timestamp,
    /// Correlation tag threaded end to end through the transport
    pub sequence: Option<u64>,
}

impl Sample {
    pub fn video(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        pts: Timestamp,
        sequence: Option<u64>,
    ) -> Self {
        Self {
            data: data.into(),
            mappable: true,
            caps: SampleCaps::Video {
                width,
                height,
                format,
            },
            pts,
            sequence,
        }
    }

    pub fn metadata(data: impl Into<Bytes>, pts: Timestamp, sequence: Option<u64>) -> Self {
        Self {
            data: data.into(),
            mappable: true,
            caps: SampleCaps::Metadata,
            pts,
            sequence,
        }
    }

    /// A sample whose buffer cannot be mapped, for fault injection.
    pub fn unmappable(caps: SampleCaps, pts: Timestamp) -> Self {
        Self {
            data: Bytes::new(),
            mappable: false,
            caps,
            pts,
            sequence: None,
        }
    }

    /// Map the underlying buffer for reading.
    ///
    /// A failed mapping is recoverable: the caller skips this sample only.
    pub fn map_read(&self) -> Result<MapGuard<'_>, StreamError> {
        if !self.mappable {
            return Err(StreamError::Resource("buffer mapping failed".into()));
        }
        Ok(MapGuard { data: &self.data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Read access to an engine buffer, valid until dropped (unmap).
pub struct MapGuard<'a> {
    data: &'a Bytes,
}

impl std::ops::Deref for MapGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_copy() {
        let sample = Sample::video(
            vec![1u8, 2, 3],
            1,
            1,
            PixelFormat::Rgb,
            Timestamp::from_micros(0),
            Some(7),
        );
        let owned = sample.map_read().unwrap().to_vec();
        assert_eq!(owned, vec![1, 2, 3]);
    }

    #[test]
    fn test_unmappable_sample_errors() {
        let sample = Sample::unmappable(SampleCaps::Metadata, Timestamp::from_micros(0));
        assert!(matches!(
            sample.map_read(),
            Err(StreamError::Resource(_))
        ));
    }
}
