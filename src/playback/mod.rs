mod engine;

pub use engine::{list_audio_devices, AudioDevice, PlaybackEngine};

use crate::audio::PcmChunk;
use crate::error::PipelineError;

/// The playback end of one pipeline: a queue into the output device.
///
/// Methods take `&self`; implementations use interior mutability.
pub trait OutputSink: Send + Sync {
    /// Queue a chunk for gapless playback
    fn append(&self, chunk: &PcmChunk);

    /// Number of chunks queued and not yet played
    fn queued(&self) -> usize;

    /// Set volume (already clamped to 0.0..=1.0)
    fn set_volume(&self, volume: f32);

    fn pause(&self);

    fn resume(&self);

    /// Drop everything queued and release the device
    fn stop(&self);
}

/// An audio output device able to hand out one sink per pipeline
pub trait AudioOutput: Send + Sync {
    fn open_sink(&self) -> Result<Box<dyn OutputSink>, PipelineError>;
}
