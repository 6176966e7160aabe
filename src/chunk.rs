//! PCM data chunk with source attribution.

use std::sync::Arc;
use std::time::Duration;

use crate::source::SourceId;

/// A discrete buffer of raw PCM bytes captured from one source.
///
/// `PcmChunk` is the fundamental unit of audio data passed from a device
/// bridge or decoder reader to the capture producer. Bytes are interleaved
/// little-endian signed 16-bit samples at the engine's configured rate.
///
/// Bytes are stored in an `Arc<Vec<u8>>` so a chunk can be handed to the
/// buffer and level paths without recopying.
///
/// # Example
///
/// ```
/// use fieldstream::{PcmChunk, SourceId};
///
/// let chunk = PcmChunk::new(SourceId::new("rtsp://cam-1"), vec![0u8; 9600]);
/// assert_eq!(chunk.len(), 9600);
/// assert_eq!(chunk.duration(48_000, 1, 2), std::time::Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// Source that captured these bytes.
    pub source_id: SourceId,

    /// Interleaved little-endian s16 PCM bytes.
    ///
    /// Wrapped in `Arc` for zero-copy sharing between consumers.
    pub bytes: Arc<Vec<u8>>,
}

impl PcmChunk {
    /// Creates a new chunk for the given source.
    pub fn new(source_id: SourceId, bytes: Vec<u8>) -> Self {
        Self {
            source_id,
            bytes: Arc::new(bytes),
        }
    }

    /// Returns the number of PCM bytes in this chunk.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if this chunk contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the play duration of this chunk for the given format.
    pub fn duration(&self, sample_rate: u32, channels: u16, bytes_per_sample: u16) -> Duration {
        let frame_bytes = channels as usize * bytes_per_sample as usize;
        if sample_rate == 0 || frame_bytes == 0 {
            return Duration::ZERO;
        }
        let frames = self.bytes.len() / frame_bytes;
        Duration::from_secs_f64(frames as f64 / f64::from(sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_mono_48khz() {
        let chunk = PcmChunk::new(SourceId::new("a"), vec![0u8; 9600]);
        assert_eq!(chunk.duration(48_000, 1, 2), Duration::from_millis(100));
    }

    #[test]
    fn test_duration_stereo() {
        let chunk = PcmChunk::new(SourceId::new("a"), vec![0u8; 19200]);
        // 19200 bytes / 4 bytes per frame = 4800 frames at 48kHz = 100ms
        assert_eq!(chunk.duration(48_000, 2, 2), Duration::from_millis(100));
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = PcmChunk::new(SourceId::new("a"), vec![]);
        assert!(chunk.is_empty());
        assert_eq!(chunk.duration(48_000, 1, 2), Duration::ZERO);
    }

    #[test]
    fn test_zero_rate() {
        let chunk = PcmChunk::new(SourceId::new("a"), vec![0u8; 100]);
        assert_eq!(chunk.duration(0, 1, 2), Duration::ZERO);
    }

    #[test]
    fn test_clone_shares_bytes() {
        let chunk = PcmChunk::new(SourceId::new("a"), vec![1, 2, 3]);
        let clone = chunk.clone();
        assert!(Arc::ptr_eq(&chunk.bytes, &clone.bytes));
    }
}
