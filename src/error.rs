use std::path::PathBuf;

use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Equalizer error: {0}")]
    Equalizer(#[from] EqualizerError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Resolver error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pipeline construction and transport errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported source {locator}: {reason}")]
    UnsupportedSource { locator: String, reason: String },

    #[error("No compatible decoder: {0}")]
    DecodeInit(String),

    #[error("Source is a live stream and cannot be seeked")]
    NotSeekable,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl PipelineError {
    pub fn unsupported(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::UnsupportedSource {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }
}

/// Equalizer command errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EqualizerError {
    #[error("Unknown equalizer preset: {0}")]
    UnknownPreset(String),

    #[error("Invalid equalizer band index {0} (expected 0..=9)")]
    InvalidBandIndex(usize),
}

/// Capture (recording) errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("A capture is already active")]
    AlreadyCapturing,

    #[error("Nothing is playing")]
    NotPlaying,

    #[error("No capture is active")]
    NotCapturing,

    #[error("Cannot write capture file {path}: {source}")]
    CaptureFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("WAV size limit reached after {0} frames; file finalized, use flac for longer recordings")]
    WavSizeLimit(u64),

    #[error("Background download error: {0}")]
    Download(String),

    #[error("Unknown capture format: {0}")]
    UnknownFormat(String),
}

impl CaptureError {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CaptureFile {
            path: path.into(),
            source,
        }
    }
}

/// External resolver errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("{0} not found - please install it")]
    ToolNotFound(String),

    #[error("Resolver failed: {0}")]
    Failed(String),

    #[error("Resolver timed out after {0}s")]
    Timeout(u64),

    #[error("Resolver output parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session-level errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to reconnect after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("No source loaded")]
    NoSource,

    #[error("Session engine has shut down")]
    Closed,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Check if this error is transient (reconnection may fix it)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Pipeline(e) if e.is_recoverable())
    }
}

impl PipelineError {
    /// Construction and stream failures are retried by the supervisor;
    /// precondition failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedSource { .. }
                | PipelineError::DecodeInit(_)
                | PipelineError::Stream(_)
        )
    }
}

impl From<ResolveError> for PipelineError {
    fn from(e: ResolveError) -> Self {
        PipelineError::UnsupportedSource {
            locator: String::from("<unresolved>"),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_failure_is_unsupported_source() {
        let err: PipelineError = ResolveError::Failed("video unavailable".into()).into();
        assert!(matches!(err, PipelineError::UnsupportedSource { .. }));
        assert!(err.to_string().contains("video unavailable"));
    }

    #[test]
    fn test_recoverable_classification() {
        let transient = EngineError::from(PipelineError::Stream("connection reset".into()));
        assert!(transient.is_recoverable());

        let precondition = EngineError::from(PipelineError::NotSeekable);
        assert!(!precondition.is_recoverable());

        let eq = EngineError::from(EqualizerError::InvalidBandIndex(12));
        assert!(!eq.is_recoverable());
    }

    #[test]
    fn test_capture_file_error_names_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = CaptureError::file("/readonly/rec.wav", io);
        assert!(err.to_string().contains("/readonly/rec.wav"));
    }
}
