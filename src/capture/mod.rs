mod download;
mod naming;

pub use download::{BackgroundDownload, CompletionHook, DownloadOutcome, ProcessSpec};
pub use naming::{render, sanitize, unique_path, NameFields};

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::audio::CaptureFormat;
use crate::config::EngineConfig;
use crate::error::CaptureError;
use crate::pipeline::{CaptureFailureHook, CaptureTap, PipelineGraph};
use crate::source::SourceDescriptor;

/// How a capture gets its audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Shaped PCM tapped from the live pipeline
    BranchTap,
    /// Separate download of the source's stable reference
    BackgroundDownload,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::BranchTap => "branch-tap",
            Self::BackgroundDownload => "background-download",
        })
    }
}

/// Result of a finished capture
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureReport {
    pub path: PathBuf,
    pub format: CaptureFormat,
    pub mode: CaptureMode,
    pub elapsed: Duration,
    /// False when the file was cut short (interrupted download)
    pub finalized: bool,
}

/// Facts about the running capture
#[derive(Debug, Clone)]
pub struct CaptureInfo {
    pub path: PathBuf,
    pub format: CaptureFormat,
    pub mode: CaptureMode,
    pub started_at: Instant,
    pub started_wall: DateTime<Local>,
}

/// The active capture, with the strategy picked once at start
pub enum CaptureSession {
    BranchTap { tap: CaptureTap, info: CaptureInfo },
    Download { download: BackgroundDownload, info: CaptureInfo },
}

impl CaptureSession {
    pub fn info(&self) -> &CaptureInfo {
        match self {
            Self::BranchTap { info, .. } | Self::Download { info, .. } => info,
        }
    }

    /// The tap to re-attach after a pipeline rebuild
    pub fn tap(&self) -> Option<&CaptureTap> {
        match self {
            Self::BranchTap { tap, .. } => Some(tap),
            Self::Download { .. } => None,
        }
    }

    /// Finalize the file. A branch tap must already be detached.
    #[instrument(skip(self), fields(path = ?self.info().path, mode = %self.info().mode))]
    pub async fn finish(self) -> Result<CaptureReport, CaptureError> {
        match self {
            Self::BranchTap { tap, info } => {
                let elapsed = info.started_at.elapsed();
                let summary = tap.finalize().await?;
                info!(frames = summary.frames, ?elapsed, "Capture finished");
                Ok(CaptureReport {
                    path: info.path,
                    format: info.format,
                    mode: info.mode,
                    elapsed,
                    finalized: true,
                })
            }
            Self::Download { download, info } => {
                let elapsed = info.started_at.elapsed();
                let outcome = download.stop().await?;
                if !outcome.is_complete() {
                    warn!(?outcome, "Download stopped early, keeping partial file");
                }
                Ok(CaptureReport {
                    path: info.path,
                    format: info.format,
                    mode: info.mode,
                    elapsed,
                    finalized: outcome.is_complete(),
                })
            }
        }
    }
}

/// What is currently playing, as seen by the capture controller
pub struct CaptureTarget<'a> {
    pub descriptor: &'a SourceDescriptor,
    /// The live graph, if one is flowing
    pub graph: Option<&'a PipelineGraph>,
    /// Latest stream title, if any
    pub title: Option<&'a str>,
    pub artist: Option<&'a str>,
}

/// Callbacks for captures that end on their own
#[derive(Clone, Default)]
pub struct CaptureHooks {
    pub on_failure: Option<CaptureFailureHook>,
    pub on_complete: Option<CompletionHook>,
}

/// Capture settings taken from the engine config
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub output_dir: PathBuf,
    pub format: CaptureFormat,
    pub template: String,
    pub ffmpeg: String,
    pub ytdlp: String,
}

impl From<&EngineConfig> for CaptureSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            format: config.capture_format,
            template: config.filename_template.clone(),
            ffmpeg: config.ffmpeg_path.clone(),
            ytdlp: config.ytdlp_path.clone(),
        }
    }
}

/// Owns the single capture slot of a session
pub struct CaptureController {
    settings: CaptureSettings,
    hooks: CaptureHooks,
    active: Option<CaptureSession>,
}

impl CaptureController {
    pub fn new(settings: CaptureSettings, hooks: CaptureHooks) -> Self {
        Self {
            settings,
            hooks,
            active: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&CaptureSession> {
        self.active.as_ref()
    }

    /// Start capturing `target`; `format` overrides the configured one
    #[instrument(skip(self, target), fields(source = %target.descriptor.display_name()))]
    pub fn start(&mut self, target: CaptureTarget<'_>, format: Option<CaptureFormat>) -> Result<&CaptureInfo, CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let format = format.unwrap_or(self.settings.format);

        let session = if target.descriptor.time_limited {
            // The locator expires; only the page URL can be downloaded later
            let page_url = target
                .descriptor
                .stable_reference
                .as_deref()
                .ok_or_else(|| CaptureError::Download("Source has no stable reference".into()))?;
            let path = self.next_path(&target, format)?;
            let download = BackgroundDownload::spawn(
                ProcessSpec::downloader(&self.settings.ytdlp, page_url),
                ProcessSpec::transcoder(&self.settings.ffmpeg, format, &path),
                &path,
                self.hooks.on_complete.clone(),
            )?;
            CaptureSession::Download {
                download,
                info: new_info(path, format, CaptureMode::BackgroundDownload),
            }
        } else {
            let graph = target.graph.ok_or(CaptureError::NotPlaying)?;
            let path = self.next_path(&target, format)?;
            let tap = graph.attach_capture_branch(format, &path, &self.settings.ffmpeg, self.hooks.on_failure.clone())?;
            CaptureSession::BranchTap {
                tap,
                info: new_info(path, format, CaptureMode::BranchTap),
            }
        };

        info!(path = ?session.info().path, mode = %session.info().mode, %format, "Capture started");
        Ok(self.active.insert(session).info())
    }

    /// Take the active session out of the slot, detaching its branch.
    /// The caller finalizes it with [`CaptureSession::finish`].
    pub fn stop(&mut self, graph: Option<&PipelineGraph>) -> Result<CaptureSession, CaptureError> {
        let session = self.active.take().ok_or(CaptureError::NotCapturing)?;
        if let (CaptureSession::BranchTap { .. }, Some(graph)) = (&session, graph) {
            graph.detach_capture_branch();
        }
        Ok(session)
    }

    /// Re-attach a branch-tap capture to a rebuilt graph
    pub fn reattach(&self, graph: &PipelineGraph) -> Result<bool, CaptureError> {
        match self.active.as_ref().and_then(CaptureSession::tap) {
            Some(tap) => {
                graph.attach_tap(tap)?;
                info!(path = ?tap.path(), "Capture re-attached");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the session writing `path`, if it is still the active one
    pub fn take_ended(&mut self, path: &Path) -> Option<CaptureSession> {
        if self.active.as_ref()?.info().path == path {
            self.active.take()
        } else {
            None
        }
    }

    fn next_path(&self, target: &CaptureTarget<'_>, format: CaptureFormat) -> Result<PathBuf, CaptureError> {
        let dir = &self.settings.output_dir;
        ensure_dir(dir)?;
        let fields = NameFields {
            station: target.descriptor.display_name(),
            title: target.title.or(target.descriptor.metadata.title.as_deref()),
            artist: target.artist,
            now: Local::now(),
        };
        let name = render(&self.settings.template, &fields, format);
        Ok(unique_path(dir, &name))
    }
}

fn ensure_dir(dir: &Path) -> Result<(), CaptureError> {
    std::fs::create_dir_all(dir).map_err(|e| CaptureError::file(dir, e))
}

fn new_info(path: PathBuf, format: CaptureFormat, mode: CaptureMode) -> CaptureInfo {
    CaptureInfo {
        path,
        format,
        mode,
        started_at: Instant::now(),
        started_wall: Local::now(),
    }
}
