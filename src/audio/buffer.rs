use std::sync::Arc;
use std::time::Duration;

/// Standard sample rate for internal processing
pub const SAMPLE_RATE: u32 = 48_000;

/// Number of audio channels (stereo)
pub const CHANNELS: u16 = 2;

/// Frames per decoded chunk (~21ms at 48kHz)
pub const CHUNK_FRAMES: usize = 1024;

/// A block of decoded, interleaved audio flowing through the pipeline
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// Interleaved stereo samples (f32, normalized to -1.0 to 1.0)
    pub samples: Arc<[f32]>,
    /// Offset of the first frame from the start of the decoded stream
    pub frame_offset: u64,
}

impl PcmChunk {
    pub fn new(samples: Vec<f32>, frame_offset: u64) -> Self {
        Self {
            samples: samples.into(),
            frame_offset,
        }
    }

    /// Number of frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        self.samples.len() / CHANNELS as usize
    }

    /// Offset of the frame right after this chunk
    pub fn end_offset(&self) -> u64 {
        self.frame_offset + self.frame_count() as u64
    }

    /// Duration of the chunk
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frame_count() as u64)
    }
}

/// Convert a frame count at the internal sample rate to a duration
pub fn frames_to_duration(frames: u64) -> Duration {
    Duration::from_secs_f64(frames as f64 / SAMPLE_RATE as f64)
}

/// Decode little-endian f32 bytes into samples
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Encode samples as little-endian f32 bytes
pub fn samples_to_le_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_offsets() {
        let chunk = PcmChunk::new(vec![0.0; CHUNK_FRAMES * CHANNELS as usize], 2048);
        assert_eq!(chunk.frame_count(), CHUNK_FRAMES);
        assert_eq!(chunk.end_offset(), 2048 + CHUNK_FRAMES as u64);
    }

    #[test]
    fn test_chunk_duration() {
        // 1 second at 48kHz stereo
        let chunk = PcmChunk::new(vec![0.0; 96_000], 0);
        assert!((chunk.duration().as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_le_bytes_decode() {
        let bytes: Vec<u8> = [0.5f32, -0.25].iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(samples_from_le_bytes(&bytes), vec![0.5, -0.25]);
        assert_eq!(samples_to_le_bytes(&[0.5, -0.25]), bytes);
    }
}
