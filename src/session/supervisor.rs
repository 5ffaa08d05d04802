use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::audio::{CaptureFormat, EqualizerControl, StreamTags};
use crate::capture::{CaptureController, CaptureInfo, CaptureReport, CaptureSession, CaptureTarget};
use crate::config::EngineConfig;
use crate::error::{CaptureError, PipelineError, SessionError};
use crate::pipeline::{Backends, GraphParams, PipelineGraph, PipelineHandle, PipelineState};
use crate::source::{MediaDuration, Resolver, SourceDescriptor, SourceRequest};

use super::channels::{NowPlaying, PlaybackState, SessionCommand, SessionEvent};
use super::Shared;

/// Upper bound of the reconnect backoff
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Delay before reconnect attempt `attempt` (1-based):
/// 50 ms, 500 ms, then doubling from 1 s up to 10 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_millis(50),
        n => {
            let doublings = (n - 2).min(16);
            Duration::from_millis(500u64 << doublings).min(MAX_BACKOFF)
        }
    }
}

/// Reconnect bookkeeping. Only the supervisor mutates it.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempts: u32,
    last_attempt: Option<Instant>,
    scheduled: Option<Duration>,
}

impl ReconnectState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn scheduled(&self) -> Option<Duration> {
        self.scheduled
    }

    /// Count the next attempt and pick its delay; `None` once `max` attempts were made
    pub fn schedule(&mut self, max: u32) -> Option<(u32, Duration)> {
        if self.attempts >= max {
            return None;
        }
        self.attempts += 1;
        let delay = backoff_delay(self.attempts);
        self.scheduled = Some(delay);
        Some((self.attempts, delay))
    }

    /// The scheduled delay elapsed and the attempt is starting
    pub fn begin_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
        self.scheduled = None;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Supervisor tuning taken from the engine config
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub stall_timeout: Duration,
}

impl From<&EngineConfig> for SupervisorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            max_attempts: config.max_reconnect_attempts,
            stall_timeout: config.stall_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Load,
    Reconnect,
    Seek,
}

type BuildResult = Result<(SourceDescriptor, PipelineGraph), PipelineError>;

/// An in-flight graph construction; dropping it cancels the construction
struct BuildJob {
    kind: JobKind,
    future: BoxFuture<'static, BuildResult>,
}

/// The session actor: owns the graph, the capture slot and the reconnect
/// state, and is the only place they change.
pub struct Supervisor {
    config: SupervisorConfig,
    backends: Backends,
    resolver: Arc<dyn Resolver>,
    equalizer: Arc<EqualizerControl>,
    shared: Arc<Shared>,
    events: broadcast::Sender<SessionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    capture: CaptureController,

    descriptor: Option<SourceDescriptor>,
    graph: Option<Arc<PipelineGraph>>,
    handle: Option<PipelineHandle>,
    tags: Option<watch::Receiver<StreamTags>>,
    job: Option<BuildJob>,
    reconnect: ReconnectState,
    reconnect_at: Option<Instant>,
    /// Offset for the next rebuild of a finite source
    resume_at: Duration,
    paused: bool,
    finishing: Vec<JoinHandle<()>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SupervisorConfig,
        backends: Backends,
        resolver: Arc<dyn Resolver>,
        equalizer: Arc<EqualizerControl>,
        shared: Arc<Shared>,
        events: broadcast::Sender<SessionEvent>,
        cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        capture: CaptureController,
    ) -> Self {
        Self {
            config,
            backends,
            resolver,
            equalizer,
            shared,
            events,
            cmd_rx,
            capture,
            descriptor: None,
            graph: None,
            handle: None,
            tags: None,
            job: None,
            reconnect: ReconnectState::default(),
            reconnect_at: None,
            resume_at: Duration::ZERO,
            paused: false,
            finishing: Vec::new(),
        }
    }

    /// Run until shutdown or until every façade handle is gone
    #[instrument(skip(self), name = "supervisor")]
    pub async fn run(mut self) {
        info!("Session actor starting");

        loop {
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => {
                        info!("Received shutdown");
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },

                (kind, result) = poll_job(&mut self.job) => {
                    self.job = None;
                    self.job_finished(kind, result);
                }

                state = watch_graph(&mut self.handle) => self.graph_changed(state),

                tags = watch_tags(&mut self.tags) => match tags {
                    Some(tags) => self.publish_now_playing(&tags),
                    // The source stopped announcing tags
                    None => self.tags = None,
                },

                _ = sleep_until_opt(reconnect_at) => self.start_reconnect_attempt(),
            }
        }

        self.cancel_all();
        self.finish_capture(None);
        for task in self.finishing.drain(..) {
            let _ = task.await;
        }
        info!("Session actor stopped");
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Load(request) => self.load(request),
            SessionCommand::Play => self.play(),
            SessionCommand::Pause => self.pause(),
            SessionCommand::Stop => {
                debug!("Received Stop command");
                self.cancel_all();
                self.finish_capture(None);
                self.set_state(PlaybackState::Stopped);
            }
            SessionCommand::Seek(position) => self.seek(position),
            SessionCommand::StartCapture { format, reply } => {
                let result = self.start_capture(format);
                let _ = reply.send(result);
            }
            SessionCommand::StopCapture { reply } => match self.capture.stop(self.graph.as_deref()) {
                Ok(session) => self.spawn_finish(session, Some(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionCommand::CaptureEnded { path } => {
                if let Some(session) = self.capture.take_ended(&path) {
                    warn!(path = ?path, "Capture ended on its own");
                    if let (CaptureSession::BranchTap { .. }, Some(graph)) = (&session, &self.graph) {
                        graph.detach_capture_branch();
                    }
                    self.spawn_finish(session, None);
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn load(&mut self, request: SourceRequest) {
        info!(source = %request.describe(), "Loading source");
        self.cancel_all();
        self.finish_capture(None);
        self.paused = false;
        // A resolved descriptor is only known once the job finishes
        self.descriptor = match &request {
            SourceRequest::Direct(descriptor) => Some(descriptor.clone()),
            SourceRequest::Resolve { .. } => None,
        };
        *self.shared.descriptor.write() = self.descriptor.clone();
        *self.shared.now_playing.write() = None;
        *self.shared.last_position.lock() = Duration::ZERO;

        self.set_state(PlaybackState::Connecting);
        self.job = Some(self.build_job(JobKind::Load, request, Duration::ZERO));
    }

    fn play(&mut self) {
        match self.shared.state() {
            PlaybackState::Paused => {
                if let Some(graph) = &self.graph {
                    graph.play();
                }
                self.paused = false;
                self.set_state(PlaybackState::Playing);
            }
            PlaybackState::Connecting | PlaybackState::Reconnecting { .. } => self.paused = false,
            PlaybackState::Stopped | PlaybackState::Failed { .. } => match self.descriptor.clone() {
                Some(descriptor) => {
                    info!("Restarting playback");
                    let start = self.start_offset(&descriptor);
                    self.cancel_all();
                    self.paused = false;
                    self.set_state(PlaybackState::Connecting);
                    self.job = Some(self.build_job(JobKind::Load, rebuild_request(descriptor), start));
                }
                None => warn!("Play requested with no source loaded"),
            },
            PlaybackState::Idle => warn!("Play requested with no source loaded"),
            PlaybackState::Playing => {}
        }
    }

    fn pause(&mut self) {
        if !self.shared.state().is_active() {
            return;
        }
        self.paused = true;
        if let Some(graph) = &self.graph {
            graph.pause();
        }
        if self.shared.state() == PlaybackState::Playing {
            self.set_state(PlaybackState::Paused);
        }
    }

    /// Rebuild at `position`. The old graph is torn down before the new one
    /// opens its sink, so at most one graph is ever live.
    fn seek(&mut self, position: Duration) {
        let Some(descriptor) = self.descriptor.clone() else {
            warn!("Seek requested with no source loaded");
            return;
        };
        let target = match (&self.graph, MediaDuration::from(descriptor.duration)) {
            (Some(graph), _) => match graph.seek_target(position) {
                Ok(target) => target,
                Err(e) => {
                    warn!(error = %e, "Seek rejected");
                    return;
                }
            },
            (None, MediaDuration::Finite(total)) => position.min(total),
            (None, MediaDuration::Live) => {
                warn!("Seek rejected on live source");
                return;
            }
        };
        self.resume_at = target;

        // A pending reconnect or a later restart picks up resume_at
        if self.graph.is_none() && self.job.is_none() {
            debug!(?target, "Seek deferred to next rebuild");
            return;
        }

        debug!(?target, "Rebuilding pipeline for seek");
        self.discard_graph();
        *self.shared.last_position.lock() = target;
        self.set_state(PlaybackState::Connecting);
        self.job = Some(self.build_job(JobKind::Seek, rebuild_request(descriptor), target));
    }

    fn start_capture(&mut self, format: Option<CaptureFormat>) -> Result<CaptureInfo, CaptureError> {
        if self.capture.is_active() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let descriptor = match &self.descriptor {
            Some(descriptor) if self.shared.state().is_active() => descriptor,
            _ => return Err(CaptureError::NotPlaying),
        };
        let (title, artist) = match self.shared.now_playing.read().as_ref() {
            Some(np) => (np.display_title().map(str::to_string), np.artist.clone()),
            None => (None, None),
        };

        let target = CaptureTarget {
            descriptor,
            graph: self.graph.as_deref(),
            title: title.as_deref(),
            artist: artist.as_deref(),
        };
        let info = self.capture.start(target, format)?.clone();

        self.shared.set_capturing(true);
        self.emit(SessionEvent::CaptureStarted {
            path: info.path.clone(),
            mode: info.mode,
            format: info.format,
        });
        Ok(info)
    }

    fn build_job(&self, kind: JobKind, request: SourceRequest, start: Duration) -> BuildJob {
        let backends = self.backends.clone();
        let resolver = self.resolver.clone();
        let equalizer = self.equalizer.clone();
        let volume = self.shared.volume();
        let stall_timeout = self.config.stall_timeout;
        self.emit(SessionEvent::Buffering(0));

        let future = Box::pin(async move {
            let descriptor = match request {
                SourceRequest::Direct(descriptor) => descriptor,
                SourceRequest::Resolve { page_url, metadata } => resolver.resolve(&page_url, &metadata).await?,
            };
            let params = GraphParams {
                descriptor: &descriptor,
                equalizer,
                volume,
                start,
                stall_timeout,
            };
            let graph = PipelineGraph::build(params, &backends).await?;
            Ok((descriptor, graph))
        });

        BuildJob { kind, future }
    }

    fn job_finished(&mut self, kind: JobKind, result: BuildResult) {
        let (descriptor, graph) = match result {
            Ok(built) => built,
            Err(e) => return self.build_failed(kind, e),
        };

        if kind == JobKind::Reconnect {
            info!(attempts = self.reconnect.attempts(), "Reconnected, resetting reconnect counter");
        }
        self.reconnect.reset();

        // A re-resolved source comes back with a fresh locator
        *self.shared.descriptor.write() = Some(descriptor.clone());
        self.descriptor = Some(descriptor);
        self.install_graph(graph);
    }

    fn build_failed(&mut self, kind: JobKind, e: PipelineError) {
        match kind {
            JobKind::Load => {
                error!(error = %e, "Failed to open source");
                self.fail(e.to_string());
            }
            JobKind::Reconnect if e.is_recoverable() => {
                warn!(attempt = self.reconnect.attempts(), error = %e, "Reconnect attempt failed");
                self.schedule_reconnect();
            }
            JobKind::Reconnect => {
                error!(error = %e, "Reconnect failed permanently");
                self.finish_capture(None);
                self.fail(e.to_string());
            }
            JobKind::Seek if e.is_recoverable() && self.config.auto_reconnect => {
                warn!(error = %e, "Seek rebuild failed, reconnecting");
                self.schedule_reconnect();
            }
            JobKind::Seek => {
                error!(error = %e, "Seek rebuild failed");
                self.finish_capture(None);
                self.fail(e.to_string());
            }
        }
    }

    fn install_graph(&mut self, graph: PipelineGraph) {
        let graph = Arc::new(graph);
        if self.paused {
            graph.pause();
        }
        match self.capture.reattach(&graph) {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to re-attach capture"),
        }

        let handle = graph.handle();
        *self.shared.current.write() = Some(graph.clone());
        self.graph = Some(graph.clone());
        self.handle = Some(handle.clone());
        self.tags = Some(graph.watch_tags());
        self.reconnect_at = None;

        self.emit(SessionEvent::Buffering(100));
        self.publish_now_playing(&graph.tags());

        self.set_state(if self.paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        });

        // A fault before we subscribed would never show up as a change
        let state = handle.state();
        if state.is_terminal() {
            self.graph_changed(state);
        }
    }

    /// Refresh now-playing from the descriptor and the latest stream tags
    fn publish_now_playing(&self, tags: &StreamTags) {
        let Some(descriptor) = &self.descriptor else {
            return;
        };
        let now_playing = NowPlaying::new(descriptor, tags);
        let changed = self.shared.now_playing.read().as_ref() != Some(&now_playing);
        if changed {
            debug!(title = ?now_playing.title, artist = ?now_playing.artist, "Now playing");
            *self.shared.now_playing.write() = Some(now_playing.clone());
            self.emit(SessionEvent::TrackChanged(now_playing));
        }
    }

    fn graph_changed(&mut self, state: PipelineState) {
        match state {
            PipelineState::Faulted(fault) => {
                warn!(%fault, "Pipeline fault");
                if let Some(descriptor) = &self.descriptor {
                    if !descriptor.is_live() {
                        if let Some(graph) = &self.graph {
                            self.resume_at = graph.position();
                        }
                    }
                }
                self.discard_graph();

                if self.config.auto_reconnect {
                    self.schedule_reconnect();
                } else {
                    self.finish_capture(None);
                    self.fail(fault.to_string());
                }
            }
            PipelineState::Ended => {
                info!("Playback finished");
                self.discard_graph();
                self.finish_capture(None);
                self.reconnect.reset();
                self.resume_at = Duration::ZERO;
                self.set_state(PlaybackState::Stopped);
            }
            _ => {}
        }
    }

    fn schedule_reconnect(&mut self) {
        let max = self.config.max_attempts;
        match self.reconnect.schedule(max) {
            Some((attempt, delay)) => {
                info!(attempt, max, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                self.reconnect_at = Some(Instant::now() + delay);
                self.emit(SessionEvent::ReconnectAttempt { attempt, max, delay });
                self.set_state(PlaybackState::Reconnecting { attempt });
            }
            None => {
                let err = SessionError::ReconnectExhausted(max);
                error!(error = %err, "Giving up");
                self.emit(SessionEvent::Fatal(err.to_string()));
                self.finish_capture(None);
                self.fail(err.to_string());
            }
        }
    }

    fn start_reconnect_attempt(&mut self) {
        self.reconnect_at = None;
        let Some(descriptor) = self.descriptor.clone() else {
            return;
        };
        self.reconnect.begin_attempt();
        let start = self.start_offset(&descriptor);
        info!(attempt = self.reconnect.attempts(), "Reconnecting");
        self.job = Some(self.build_job(JobKind::Reconnect, rebuild_request(descriptor), start));
    }

    /// Where a rebuild of `descriptor` starts: live sources always rejoin at the edge
    fn start_offset(&self, descriptor: &SourceDescriptor) -> Duration {
        match MediaDuration::from(descriptor.duration) {
            MediaDuration::Live => Duration::ZERO,
            MediaDuration::Finite(_) => self.resume_at,
        }
    }

    /// Drop the current graph; an attached capture tap stays with the controller
    fn discard_graph(&mut self) {
        if let Some(graph) = self.graph.take() {
            *self.shared.last_position.lock() = graph.position();
            graph.detach_capture_branch();
            graph.stop();
        }
        self.handle = None;
        self.tags = None;
        *self.shared.current.write() = None;
    }

    /// Cancel in-flight construction, pending reconnects, and the graph
    fn cancel_all(&mut self) {
        self.job = None;
        self.reconnect_at = None;
        self.reconnect.reset();
        self.resume_at = Duration::ZERO;
        self.discard_graph();
    }

    fn fail(&mut self, message: String) {
        self.job = None;
        self.reconnect_at = None;
        self.discard_graph();
        self.set_state(PlaybackState::Failed { message });
    }

    /// Finalize the active capture in the background
    fn finish_capture(&mut self, reply: Option<oneshot::Sender<Result<CaptureReport, CaptureError>>>) {
        match self.capture.stop(self.graph.as_deref()) {
            Ok(session) => self.spawn_finish(session, reply),
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    fn spawn_finish(
        &mut self,
        session: CaptureSession,
        reply: Option<oneshot::Sender<Result<CaptureReport, CaptureError>>>,
    ) {
        self.shared.set_capturing(false);
        let events = self.events.clone();
        self.finishing.retain(|task| !task.is_finished());
        self.finishing.push(tokio::spawn(async move {
            let result = session.finish().await;
            match &result {
                Ok(report) => {
                    info!(path = ?report.path, finalized = report.finalized, "Capture stopped");
                    let _ = events.send(SessionEvent::CaptureStopped(report.clone()));
                }
                Err(e) => {
                    error!(error = %e, "Capture failed");
                    let _ = events.send(SessionEvent::CaptureFailed(e.to_string()));
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }));
    }

    fn set_state(&self, state: PlaybackState) {
        if self.shared.state() == state {
            return;
        }
        info!(%state, "Playback state");
        self.shared.state.send_replace(state.clone());
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// How to rebuild a known source. Time-limited locators expire, so they
/// are resolved again from their stable reference.
fn rebuild_request(descriptor: SourceDescriptor) -> SourceRequest {
    if descriptor.time_limited {
        if let Some(page_url) = descriptor.stable_reference.clone() {
            return SourceRequest::Resolve {
                page_url,
                metadata: descriptor.metadata,
            };
        }
    }
    SourceRequest::Direct(descriptor)
}

async fn poll_job(job: &mut Option<BuildJob>) -> (JobKind, BuildResult) {
    match job {
        Some(job) => {
            let result = (&mut job.future).await;
            (job.kind, result)
        }
        None => std::future::pending().await,
    }
}

async fn watch_graph(handle: &mut Option<PipelineHandle>) -> PipelineState {
    if let Some(handle) = handle {
        if let Some(state) = handle.changed().await {
            return state;
        }
    }
    std::future::pending().await
}

/// Next tag update; `None` once the source can no longer send any
async fn watch_tags(tags: &mut Option<watch::Receiver<StreamTags>>) -> Option<StreamTags> {
    match tags {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
