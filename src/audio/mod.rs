mod buffer;
mod decode;
mod encode;
mod equalizer;
mod stream;

pub use buffer::{frames_to_duration, PcmChunk, CHANNELS, CHUNK_FRAMES, SAMPLE_RATE};
pub use decode::{DecodeItem, DecodedStream, Decoder, FfmpegDecoder};
pub use encode::{CaptureEncoder, CaptureFormat, EncodeSummary};
pub use equalizer::{
    band_frequency, band_label, clamp_gain, find_preset, preset_keys, EqualizerControl, EqualizerState, Preset,
    Shaper, BAND_COUNT, BAND_FREQUENCIES, BAND_LABELS, CUSTOM_PRESET, GAIN_MAX_DB, GAIN_MIN_DB, PRESETS,
};
pub use stream::{SourceOpener, StreamTags};
