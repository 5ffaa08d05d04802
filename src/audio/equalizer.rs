//! Ten-band graphic equalizer: preset table, shared band state, and the
//! peaking-filter bank that shapes decoded audio before the branch point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::EqualizerError;

use super::buffer::{CHANNELS, SAMPLE_RATE};

/// Number of equalizer bands
pub const BAND_COUNT: usize = 10;

/// Lowest allowed band gain in dB
pub const GAIN_MIN_DB: f32 = -24.0;

/// Highest allowed band gain in dB
pub const GAIN_MAX_DB: f32 = 12.0;

/// Center frequency of each band in Hz
pub const BAND_FREQUENCIES: [f32; BAND_COUNT] = [
    31.0, 62.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

pub const BAND_LABELS: [&str; BAND_COUNT] = [
    "31 Hz", "62 Hz", "125 Hz", "250 Hz", "500 Hz", "1 kHz", "2 kHz", "4 kHz", "8 kHz", "16 kHz",
];

/// Preset name recorded once bands diverge from the last preset
pub const CUSTOM_PRESET: &str = "custom";

/// Bandwidth of each peaking filter (about one octave)
const BAND_Q: f32 = 1.41;

/// Built-in equalizer preset
#[derive(Debug, Clone, Copy)]
pub struct Preset {
    pub key: &'static str,
    pub name: &'static str,
    pub gains: [f32; BAND_COUNT],
}

/// Built-in preset table (read-only)
pub const PRESETS: &[Preset] = &[
    Preset {
        key: "flat",
        name: "Flat",
        gains: [0.0; BAND_COUNT],
    },
    Preset {
        key: "rock",
        name: "Rock",
        gains: [4.0, 3.0, -2.0, -3.0, -1.0, 2.0, 4.0, 5.0, 5.0, 5.0],
    },
    Preset {
        key: "pop",
        name: "Pop",
        gains: [-1.0, -1.0, 0.0, 2.0, 4.0, 4.0, 2.0, 0.0, -1.0, -1.0],
    },
    Preset {
        key: "jazz",
        name: "Jazz",
        gains: [3.0, 2.0, 1.0, 2.0, -1.0, -1.0, 0.0, 1.0, 2.0, 3.0],
    },
    Preset {
        key: "classical",
        name: "Classical",
        gains: [4.0, 3.0, 2.0, 0.0, -1.0, -1.0, 0.0, 2.0, 3.0, 4.0],
    },
    Preset {
        key: "speech",
        name: "Speech",
        gains: [-3.0, -2.0, -1.0, 1.0, 3.0, 4.0, 4.0, 3.0, 1.0, 0.0],
    },
    Preset {
        key: "bass-boost",
        name: "Bass Boost",
        gains: [6.0, 5.0, 4.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    },
    Preset {
        key: "treble-boost",
        name: "Treble Boost",
        gains: [0.0, 0.0, 0.0, 0.0, 0.0, 2.0, 4.0, 5.0, 6.0, 6.0],
    },
    Preset {
        key: "vocal-boost",
        name: "Vocal Boost",
        gains: [-2.0, -1.0, 0.0, 2.0, 4.0, 5.0, 4.0, 2.0, 0.0, -1.0],
    },
];

/// Look up a preset by key
pub fn find_preset(key: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.key == key)
}

/// Keys of all built-in presets
pub fn preset_keys() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|p| p.key)
}

/// Clamp a gain into the valid range. NaN maps to 0 dB.
pub fn clamp_gain(gain_db: f32) -> f32 {
    if gain_db.is_nan() {
        return 0.0;
    }
    gain_db.clamp(GAIN_MIN_DB, GAIN_MAX_DB)
}

fn check_band(index: usize) -> Result<(), EqualizerError> {
    if index < BAND_COUNT {
        Ok(())
    } else {
        Err(EqualizerError::InvalidBandIndex(index))
    }
}

/// Center frequency for a band index
pub fn band_frequency(index: usize) -> Result<f32, EqualizerError> {
    check_band(index)?;
    Ok(BAND_FREQUENCIES[index])
}

/// Display label for a band index
pub fn band_label(index: usize) -> Result<&'static str, EqualizerError> {
    check_band(index)?;
    Ok(BAND_LABELS[index])
}

/// Ten band gains, the last-applied preset name and the bypass switch.
///
/// Persisted as part of the engine config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizerState {
    gains: [f32; BAND_COUNT],
    preset: String,
    enabled: bool,
}

impl Default for EqualizerState {
    fn default() -> Self {
        Self {
            gains: [0.0; BAND_COUNT],
            preset: String::from("flat"),
            enabled: true,
        }
    }
}

impl EqualizerState {
    /// Replace all gains with a built-in preset
    pub fn apply_preset(&mut self, key: &str) -> Result<(), EqualizerError> {
        let preset = find_preset(key).ok_or_else(|| EqualizerError::UnknownPreset(key.to_string()))?;
        self.gains = preset.gains;
        self.preset = preset.key.to_string();
        Ok(())
    }

    /// Set one band, clamping the gain. Returns the stored value.
    pub fn set_band(&mut self, index: usize, gain_db: f32) -> Result<f32, EqualizerError> {
        check_band(index)?;
        let gain = clamp_gain(gain_db);
        self.gains[index] = gain;

        let matches_preset = find_preset(&self.preset)
            .map(|p| p.gains == self.gains)
            .unwrap_or(false);
        if !matches_preset {
            self.preset = CUSTOM_PRESET.to_string();
        }
        Ok(gain)
    }

    pub fn get_band(&self, index: usize) -> Result<f32, EqualizerError> {
        check_band(index)?;
        Ok(self.gains[index])
    }

    pub fn gains(&self) -> &[f32; BAND_COUNT] {
        &self.gains
    }

    pub fn preset(&self) -> &str {
        &self.preset
    }

    pub fn is_flat(&self) -> bool {
        self.gains.iter().all(|g| *g == 0.0)
    }

    pub fn reset_to_flat(&mut self) {
        self.gains = [0.0; BAND_COUNT];
        self.preset = String::from("flat");
    }

    /// Whether shaping is applied; a disabled equalizer passes audio through
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Clamp gains and fix up the preset name of a state read from disk
    pub fn sanitized(mut self) -> Self {
        for gain in &mut self.gains {
            *gain = clamp_gain(*gain);
        }
        let matches_preset = find_preset(&self.preset)
            .map(|p| p.gains == self.gains)
            .unwrap_or(false);
        if !matches_preset {
            self.preset = CUSTOM_PRESET.to_string();
        }
        self
    }
}

/// Equalizer state shared between the session and every live pipeline.
///
/// Mutations replace the band vector under a write lock and bump a
/// generation counter; the data path re-reads the full vector when the
/// generation changes, so a buffer never sees a half-updated set of bands.
#[derive(Debug, Default)]
pub struct EqualizerControl {
    state: RwLock<EqualizerState>,
    generation: AtomicU64,
}

impl EqualizerControl {
    pub fn new(state: EqualizerState) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
            generation: AtomicU64::new(0),
        })
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn apply_preset(&self, key: &str) -> Result<(), EqualizerError> {
        self.state.write().apply_preset(key)?;
        self.bump();
        info!(preset = key, "Applied equalizer preset");
        Ok(())
    }

    pub fn set_band(&self, index: usize, gain_db: f32) -> Result<f32, EqualizerError> {
        let gain = self.state.write().set_band(index, gain_db)?;
        self.bump();
        debug!(band = index, gain, "Equalizer band set");
        Ok(gain)
    }

    pub fn get_band(&self, index: usize) -> Result<f32, EqualizerError> {
        self.state.read().get_band(index)
    }

    pub fn reset_to_flat(&self) {
        self.state.write().reset_to_flat();
        self.bump();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().set_enabled(enabled);
        self.bump();
        info!(enabled, "Equalizer toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().is_enabled()
    }

    /// Copy of the current state
    pub fn get_state(&self) -> EqualizerState {
        self.state.read().clone()
    }

    /// Replace everything at once (restoring saved settings)
    pub fn set_state(&self, state: EqualizerState) {
        *self.state.write() = state.sanitized();
        self.bump();
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Generation and state read together
    fn snapshot(&self) -> (u64, EqualizerState) {
        let state = self.state.read();
        (self.generation(), state.clone())
    }
}

/// Normalized biquad coefficients
#[derive(Debug, Clone, Copy, PartialEq)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    /// RBJ cookbook peaking filter
    fn peaking(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> Self {
        let a = 10f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }
}

/// Per-channel filter memory (transposed direct form II)
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    z1: f32,
    z2: f32,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, c: &Coefficients, x: f32) -> f32 {
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y
    }
}

#[derive(Debug, Clone)]
struct Band {
    gain_db: f32,
    coefficients: Coefficients,
    channels: [BiquadState; CHANNELS as usize],
}

/// Filter bank owned by one pipeline's data path
pub struct Shaper {
    control: Arc<EqualizerControl>,
    generation: u64,
    enabled: bool,
    bands: Vec<Band>,
}

impl Shaper {
    pub fn new(control: Arc<EqualizerControl>) -> Self {
        let (generation, state) = control.snapshot();
        let bands = state
            .gains()
            .iter()
            .zip(BAND_FREQUENCIES)
            .map(|(&gain_db, freq)| Band {
                gain_db,
                coefficients: Coefficients::peaking(freq, gain_db, BAND_Q, SAMPLE_RATE as f32),
                channels: Default::default(),
            })
            .collect();

        Self {
            control,
            generation,
            enabled: state.is_enabled(),
            bands,
        }
    }

    /// Pick up band changes published since the last chunk
    fn sync(&mut self) {
        if self.control.generation() == self.generation {
            return;
        }
        let (generation, state) = self.control.snapshot();
        if state.is_enabled() && !self.enabled {
            // stale memory from before the bypass would click
            for band in &mut self.bands {
                band.channels = Default::default();
            }
        }
        self.enabled = state.is_enabled();
        for ((band, &gain_db), freq) in self.bands.iter_mut().zip(state.gains()).zip(BAND_FREQUENCIES) {
            if band.gain_db != gain_db {
                band.gain_db = gain_db;
                // filter memory is kept so gain changes don't click
                band.coefficients = Coefficients::peaking(freq, gain_db, BAND_Q, SAMPLE_RATE as f32);
            }
        }
        self.generation = generation;
    }

    /// Shape interleaved stereo samples in place
    pub fn process(&mut self, samples: &mut [f32]) {
        self.sync();
        if !self.enabled {
            return;
        }

        for band in self.bands.iter_mut().filter(|b| b.gain_db != 0.0) {
            let coefficients = band.coefficients;
            for frame in samples.chunks_exact_mut(CHANNELS as usize) {
                for (sample, state) in frame.iter_mut().zip(band.channels.iter_mut()) {
                    *sample = state.process(&coefficients, *sample);
                }
            }
        }
    }
}
