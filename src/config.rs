use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::{CaptureFormat, EqualizerState};
use crate::error::EngineError;

/// Default filename template for recordings
pub const DEFAULT_TEMPLATE: &str = "{station}_{date}_{time}";

/// Engine configuration, passed explicitly to the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where capture files are written
    pub output_dir: PathBuf,
    pub capture_format: CaptureFormat,
    pub filename_template: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// No decoded audio for this long while playing is a fault
    #[serde(with = "secs")]
    pub stall_timeout: Duration,
    /// HTTP connect timeout for stream sources
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    pub ffmpeg_path: String,
    pub ytdlp_path: String,
    pub initial_volume: f32,
    /// Output device index (see `--list-devices`); default device when unset
    pub output_device: Option<usize>,
    /// Equalizer settings restored at startup and saved when they change
    pub equalizer: EqualizerState,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            capture_format: CaptureFormat::Mp3,
            filename_template: DEFAULT_TEMPLATE.to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: 15,
            stall_timeout: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(10),
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),
            initial_volume: 1.0,
            output_device: None,
            equalizer: EqualizerState::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Music")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Recordings")
}

impl EngineConfig {
    /// Default location: `<config_dir>/webradio/engine.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("webradio").join("engine.json"))
    }

    /// The file `load` reads: `path` when given, else the default location
    pub fn resolve_path(path: Option<&Path>) -> Option<PathBuf> {
        path.map(Path::to_path_buf).or_else(Self::default_path)
    }

    /// Load from `path`, or from the default location. A missing file
    /// yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let path = match Self::resolve_path(path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        info!(path = ?path, "Loaded config");
        Ok(config.normalized())
    }

    /// Write the config as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp values that have a valid range
    pub fn normalized(mut self) -> Self {
        self.initial_volume = clamp_volume(self.initial_volume);
        if self.filename_template.trim().is_empty() {
            self.filename_template = DEFAULT_TEMPLATE.to_string();
        }
        if self.stall_timeout.is_zero() {
            self.stall_timeout = Self::default().stall_timeout;
        }
        self.equalizer = self.equalizer.sanitized();
        self
    }
}

/// Clamp a volume level to 0.0..=1.0 (NaN is silence)
pub fn clamp_volume(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| serde::de::Error::custom("duration must be a non-negative number of seconds"))
    }
}
