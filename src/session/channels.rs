use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::audio::{CaptureFormat, StreamTags};
use crate::capture::{CaptureInfo, CaptureMode, CaptureReport};
use crate::error::CaptureError;
use crate::source::{SourceDescriptor, SourceRequest};

/// Events kept for slow subscribers before they start lagging
const EVENT_CAPACITY: usize = 256;

/// User-visible playback state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PlaybackState {
    /// Nothing loaded
    #[default]
    Idle,
    /// Opening a source
    Connecting,
    Playing,
    Paused,
    /// Waiting for or running reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    Stopped,
    Failed { message: String },
}

impl PlaybackState {
    /// Whether a source is loaded and meant to be heard
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Playing | Self::Paused | Self::Reconnecting { .. }
        )
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Playing => f.write_str("playing"),
            Self::Paused => f.write_str("paused"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

/// What is playing right now
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub origin: Option<String>,
    pub artwork: Option<String>,
    /// Station name announced by the stream
    pub stream_name: Option<String>,
    pub genre: Option<String>,
}

impl NowPlaying {
    /// Track titles announced in the stream win over the descriptor's title
    pub fn new(descriptor: &SourceDescriptor, tags: &StreamTags) -> Self {
        Self {
            title: tags.title.clone().or_else(|| descriptor.metadata.title.clone()),
            artist: tags.artist.clone(),
            origin: descriptor.metadata.origin.clone(),
            artwork: descriptor.metadata.artwork.clone(),
            stream_name: tags.name.clone(),
            genre: tags.genre.clone(),
        }
    }

    /// Best name for display and recordings
    pub fn display_title(&self) -> Option<&str> {
        self.title.as_deref().or(self.stream_name.as_deref())
    }
}

/// Notifications to collaborators
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TrackChanged(NowPlaying),
    StateChanged(PlaybackState),
    /// Fill level while a pipeline prebuffers: 0 when construction starts, 100 once audio flows
    Buffering(u8),
    CaptureStarted {
        path: PathBuf,
        mode: CaptureMode,
        format: CaptureFormat,
    },
    CaptureStopped(CaptureReport),
    CaptureFailed(String),
    ReconnectAttempt { attempt: u32, max: u32, delay: Duration },
    Fatal(String),
}

/// Commands from the façade to the session actor
#[derive(Debug)]
pub enum SessionCommand {
    Load(SourceRequest),
    Play,
    Pause,
    Stop,
    Seek(Duration),
    StartCapture {
        format: Option<CaptureFormat>,
        reply: oneshot::Sender<Result<CaptureInfo, CaptureError>>,
    },
    StopCapture {
        reply: oneshot::Sender<Result<CaptureReport, CaptureError>>,
    },
    /// A capture writer or download ended without being asked to
    CaptureEnded { path: PathBuf },
    Shutdown,
}

/// Channel bundle between the façade and the actor
pub struct Channels {
    pub cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    pub cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    pub event_tx: broadcast::Sender<SessionEvent>,
}

impl Channels {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            cmd_tx,
            cmd_rx,
            event_tx,
        }
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_title_wins_over_descriptor_title() {
        let descriptor = SourceDescriptor::live("http://radio.example/stream")
            .with_title("Morning Show")
            .with_origin("Test FM");
        let mut tags = StreamTags {
            name: Some("Test FM 101.5".into()),
            ..Default::default()
        };

        let now = NowPlaying::new(&descriptor, &tags);
        assert_eq!(now.display_title(), Some("Morning Show"));
        assert_eq!(now.artist, None);

        tags.title = Some("One More Time".into());
        tags.artist = Some("Daft Punk".into());
        let now = NowPlaying::new(&descriptor, &tags);
        assert_eq!(now.display_title(), Some("One More Time"));
        assert_eq!(now.artist.as_deref(), Some("Daft Punk"));
        assert_eq!(now.origin.as_deref(), Some("Test FM"));
    }
}
