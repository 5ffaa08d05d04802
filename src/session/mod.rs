//! Playback session: the façade the presentation layer talks to.
//!
//! Every mutating call is a message to the session actor ([`Supervisor`]),
//! which owns the pipeline graph, the capture slot and the reconnect state.
//! Queries read a small shared snapshot and never wait on the actor.

mod channels;
mod supervisor;

pub use channels::{NowPlaying, PlaybackState, SessionCommand, SessionEvent};
pub use supervisor::{backoff_delay, ReconnectState, SupervisorConfig};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::audio::{CaptureFormat, EqualizerControl, EqualizerState};
use crate::capture::{CaptureController, CaptureHooks, CaptureInfo, CaptureReport, CaptureSettings, CompletionHook};
use crate::config::{clamp_volume, EngineConfig};
use crate::error::{EqualizerError, PipelineError, Result, SessionError};
use crate::pipeline::{Backends, CaptureFailureHook, PipelineGraph, PipelineHandle};
use crate::source::{MediaDuration, Resolver, SourceDescriptor, SourceRequest};

use channels::Channels;
use supervisor::Supervisor;

/// State the actor publishes and the façade reads
pub(crate) struct Shared {
    state: watch::Sender<PlaybackState>,
    /// `f32` bits
    volume: AtomicU32,
    capturing: AtomicBool,
    current: RwLock<Option<Arc<PipelineGraph>>>,
    descriptor: RwLock<Option<SourceDescriptor>>,
    now_playing: RwLock<Option<NowPlaying>>,
    /// Position of the last graph, reported while none is running
    last_position: Mutex<Duration>,
}

impl Shared {
    fn new(volume: f32) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            state,
            volume: AtomicU32::new(clamp_volume(volume).to_bits()),
            capturing: AtomicBool::new(false),
            current: RwLock::new(None),
            descriptor: RwLock::new(None),
            now_playing: RwLock::new(None),
            last_position: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn state(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    pub(crate) fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }

    pub(crate) fn set_capturing(&self, capturing: bool) {
        self.capturing.store(capturing, Ordering::Release);
    }
}

/// Handle to a running playback session
pub struct PlaybackSession {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    shared: Arc<Shared>,
    equalizer: Arc<EqualizerControl>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackSession {
    /// Start a session on the current tokio runtime
    pub fn new(config: &EngineConfig, backends: Backends, resolver: Arc<dyn Resolver>) -> Self {
        Self::spawn_on(&Handle::current(), config, backends, resolver)
    }

    /// Start a session whose actor and pipelines run on `runtime`
    pub fn spawn_on(runtime: &Handle, config: &EngineConfig, backends: Backends, resolver: Arc<dyn Resolver>) -> Self {
        let Channels {
            cmd_tx,
            cmd_rx,
            event_tx,
        } = Channels::new();
        let shared = Arc::new(Shared::new(config.initial_volume));
        let equalizer = EqualizerControl::new(config.equalizer.clone());

        let capture = CaptureController::new(CaptureSettings::from(config), capture_hooks(&cmd_tx));
        let supervisor = Supervisor::new(
            SupervisorConfig::from(config),
            backends,
            resolver,
            equalizer.clone(),
            shared.clone(),
            event_tx.clone(),
            cmd_rx,
            capture,
        );
        let actor = runtime.spawn(supervisor.run());
        info!("Playback session started");

        Self {
            cmd_tx,
            events: event_tx,
            shared,
            equalizer,
            actor: Mutex::new(Some(actor)),
        }
    }

    fn send(&self, cmd: SessionCommand) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| SessionError::Closed)?;
        Ok(())
    }

    /// Replace the current source. Cancels pending reconnects and
    /// finalizes any active capture.
    pub fn load(&self, request: impl Into<SourceRequest>) -> Result<()> {
        self.send(SessionCommand::Load(request.into()))
    }

    pub fn play(&self) -> Result<()> {
        self.send(SessionCommand::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(SessionCommand::Pause)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(SessionCommand::Stop)
    }

    /// Seek a finite source. Live sources reject with `NotSeekable`.
    pub fn seek(&self, position: Duration) -> Result<()> {
        let live = match self.shared.descriptor.read().as_ref() {
            Some(descriptor) => descriptor.is_live(),
            None => return Err(SessionError::NoSource.into()),
        };
        if live {
            return Err(PipelineError::NotSeekable.into());
        }
        self.send(SessionCommand::Seek(position))
    }

    /// Set the output level, clamped to [0, 1]. Applies immediately and
    /// survives reconnects.
    pub fn set_volume(&self, level: f32) -> f32 {
        let level = clamp_volume(level);
        self.shared.volume.store(level.to_bits(), Ordering::Release);
        if let Some(graph) = self.shared.current.read().as_ref() {
            graph.set_volume(level);
        }
        debug!(level, "Volume set");
        level
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    pub fn get_now_playing(&self) -> Option<NowPlaying> {
        self.shared.now_playing.read().clone()
    }

    /// Playback position of the current source
    pub fn get_position(&self) -> Duration {
        match self.shared.current.read().as_ref() {
            Some(graph) => graph.position(),
            None => *self.shared.last_position.lock(),
        }
    }

    /// Length of the current source, `None` when nothing is loaded
    pub fn get_duration(&self) -> Option<MediaDuration> {
        self.shared
            .descriptor
            .read()
            .as_ref()
            .map(|descriptor| MediaDuration::from(descriptor.duration))
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    /// Watch the playback state without going through the event stream
    pub fn watch_state(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state.subscribe()
    }

    /// Observer view of the running graph
    pub fn pipeline_handle(&self) -> Option<PipelineHandle> {
        self.shared.current.read().as_ref().map(|graph| graph.handle())
    }

    pub fn get_equalizer(&self) -> EqualizerState {
        self.equalizer.get_state()
    }

    /// Set one band; returns the clamped gain
    pub fn set_equalizer_band(&self, index: usize, gain_db: f32) -> std::result::Result<f32, EqualizerError> {
        self.equalizer.set_band(index, gain_db)
    }

    pub fn apply_equalizer_preset(&self, name: &str) -> std::result::Result<(), EqualizerError> {
        self.equalizer.apply_preset(name)
    }

    pub fn reset_equalizer(&self) {
        self.equalizer.reset_to_flat();
    }

    /// Bypass (or re-enable) shaping without losing the band settings
    pub fn set_equalizer_enabled(&self, enabled: bool) {
        self.equalizer.set_enabled(enabled);
    }

    pub fn is_equalizer_enabled(&self) -> bool {
        self.equalizer.is_enabled()
    }

    /// Restore saved equalizer settings
    pub fn set_equalizer_state(&self, state: EqualizerState) {
        self.equalizer.set_state(state);
    }

    /// Start recording what is playing; `format` overrides the configured one
    pub async fn start_capture(&self, format: Option<CaptureFormat>) -> Result<CaptureInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::StartCapture { format, reply })?;
        let info = rx.await.map_err(|_| SessionError::Closed)??;
        Ok(info)
    }

    /// Stop recording. Returns once the file is finalized.
    pub async fn stop_capture(&self) -> Result<CaptureReport> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::StopCapture { reply })?;
        let report = rx.await.map_err(|_| SessionError::Closed)??;
        Ok(report)
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stop playback, finalize any capture and wait for the actor to exit
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            if let Err(e) = actor.await {
                error!(error = %e, "Session actor crashed");
            }
        }
    }
}

/// Captures that end on their own report back to the actor by path.
/// Weak senders so the hooks never keep the command channel open.
fn capture_hooks(cmd_tx: &mpsc::UnboundedSender<SessionCommand>) -> CaptureHooks {
    let on_failure: CaptureFailureHook = {
        let tx = cmd_tx.downgrade();
        Arc::new(move |path, _| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SessionCommand::CaptureEnded { path: path.to_path_buf() });
            }
        })
    };
    let on_complete: CompletionHook = {
        let tx = cmd_tx.downgrade();
        Arc::new(move |path, _| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SessionCommand::CaptureEnded { path: path.to_path_buf() });
            }
        })
    };
    CaptureHooks {
        on_failure: Some(on_failure),
        on_complete: Some(on_complete),
    }
}
