mod branch;

pub use branch::{BranchPoint, CaptureFailureHook, CaptureTap};

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn, Instrument};

use crate::audio::{
    frames_to_duration, CaptureFormat, DecodeItem, DecodedStream, Decoder, EqualizerControl, PcmChunk, Shaper,
    StreamTags,
};
use crate::config::clamp_volume;
use crate::error::{CaptureError, PipelineError};
use crate::playback::{AudioOutput, OutputSink};
use crate::source::{MediaDuration, SourceDescriptor};

/// Chunks allowed in the output queue before the data task waits (~170 ms)
const MAX_QUEUED_CHUNKS: usize = 8;

/// Poll interval while the output queue is full
const PACE_INTERVAL: Duration = Duration::from_millis(10);

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Why a graph stopped flowing on its own
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// I/O or decode error
    Stream(String),
    /// A live source stopped sending
    EndOfStream,
    /// No decoded audio within the stall window
    Stall(Duration),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(reason) => write!(f, "stream error: {}", reason),
            Self::EndOfStream => f.write_str("live stream ended"),
            Self::Stall(window) => write!(f, "no audio for {}s", window.as_secs_f32()),
        }
    }
}

/// Lifecycle of one graph instance. `Faulted`, `Stopped` and `Ended` are terminal.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Connecting,
    Flowing,
    Faulted(Fault),
    Stopped,
    /// A finite source played to its end
    Ended,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Faulted(_) | Self::Stopped | Self::Ended)
    }
}

/// Decode and output backends shared by every graph of a session
#[derive(Clone)]
pub struct Backends {
    pub decoder: Arc<dyn Decoder>,
    pub output: Arc<dyn AudioOutput>,
}

/// Inputs for one graph construction
pub struct GraphParams<'a> {
    pub descriptor: &'a SourceDescriptor,
    pub equalizer: Arc<EqualizerControl>,
    pub volume: f32,
    pub start: Duration,
    pub stall_timeout: Duration,
}

/// Read-only view of a graph for observers
#[derive(Clone)]
pub struct PipelineHandle {
    id: u64,
    state: watch::Receiver<PipelineState>,
    branch: Arc<BranchPoint>,
}

impl PipelineHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Wait for the next state change. Returns the new state, or `None`
    /// if the graph is gone.
    pub async fn changed(&mut self) -> Option<PipelineState> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    /// Whether a capture endpoint is currently attached
    pub fn has_capture(&self) -> bool {
        self.branch.has_capture()
    }

    pub fn capture_attach_count(&self) -> u64 {
        self.branch.attach_count()
    }
}

/// Playback-side state shared between the graph and its data task
struct Transport {
    sink: Box<dyn OutputSink>,
    paused: AtomicBool,
    appended_frames: AtomicU64,
    /// Frame count of each chunk still in the sink, oldest first
    in_flight: Mutex<VecDeque<usize>>,
}

impl Transport {
    fn new(sink: Box<dyn OutputSink>) -> Self {
        Self {
            sink,
            paused: AtomicBool::new(false),
            appended_frames: AtomicU64::new(0),
            in_flight: Mutex::new(VecDeque::new()),
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn append(&self, chunk: &PcmChunk) {
        let mut in_flight = self.in_flight.lock();
        self.sink.append(chunk);
        in_flight.push_back(chunk.frame_count());
        self.appended_frames
            .fetch_add(chunk.frame_count() as u64, Ordering::AcqRel);
    }

    /// Frames that have left the output queue
    fn played_frames(&self) -> u64 {
        let mut in_flight = self.in_flight.lock();
        let queued = self.sink.queued();
        while in_flight.len() > queued {
            in_flight.pop_front();
        }
        let queued_frames: u64 = in_flight.iter().map(|frames| *frames as u64).sum();
        self.appended_frames
            .load(Ordering::Acquire)
            .saturating_sub(queued_frames)
    }
}

/// source -> decode -> shape -> branch point -> {playback, capture}
pub struct PipelineGraph {
    id: u64,
    state: Arc<watch::Sender<PipelineState>>,
    branch: Arc<BranchPoint>,
    transport: Arc<Transport>,
    start: Duration,
    duration: MediaDuration,
    tags: watch::Receiver<StreamTags>,
    task: JoinHandle<()>,
}

impl PipelineGraph {
    /// Build a graph and wait for its first decoded chunk.
    ///
    /// On success the graph is `Flowing`. On failure nothing is left running.
    #[instrument(skip_all, fields(locator = %params.descriptor.locator, start = ?params.start))]
    pub async fn build(params: GraphParams<'_>, backends: &Backends) -> Result<Self, PipelineError> {
        let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = watch::channel(PipelineState::Connecting);
        debug!(pipeline = id, "Connecting");

        let sink = backends.output.open_sink()?;
        sink.set_volume(clamp_volume(params.volume));

        let mut decoded = backends
            .decoder
            .open(&params.descriptor.locator, params.start)
            .await?;

        let first = match timeout(params.stall_timeout, decoded.next_chunk()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(PipelineError::DecodeInit("Source ended before any audio".into())),
            Err(_) => {
                return Err(PipelineError::Stream(format!(
                    "No audio within {}s",
                    params.stall_timeout.as_secs_f32()
                )))
            }
        };

        let tags = decoded.tags();
        let state = Arc::new(state_tx);
        let branch = Arc::new(BranchPoint::new());
        let transport = Arc::new(Transport::new(sink));
        let duration = MediaDuration::from(params.descriptor.duration);

        let data_path = DataPath {
            shaper: Shaper::new(params.equalizer),
            branch: branch.clone(),
            transport: transport.clone(),
            state: state.clone(),
            live: duration == MediaDuration::Live,
            stall_timeout: params.stall_timeout,
        };
        // Flowing before the task starts so an early fault is never overwritten
        state.send_replace(PipelineState::Flowing);
        let task = tokio::spawn(
            data_path
                .run(decoded, first)
                .instrument(tracing::debug_span!("data_path", pipeline = id)),
        );
        info!(pipeline = id, "Pipeline flowing");

        Ok(Self {
            id,
            state,
            branch,
            transport,
            start: params.start,
            duration,
            tags,
            task,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            id: self.id,
            state: self.state.subscribe(),
            branch: self.branch.clone(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Current stream tags
    pub fn tags(&self) -> StreamTags {
        self.tags.borrow().clone()
    }

    /// Follow in-stream tag updates (new track titles)
    pub fn watch_tags(&self) -> watch::Receiver<StreamTags> {
        self.tags.clone()
    }

    pub fn play(&self) {
        self.transport.paused.store(false, Ordering::Release);
        self.transport.sink.resume();
    }

    pub fn pause(&self) {
        self.transport.paused.store(true, Ordering::Release);
        self.transport.sink.pause();
    }

    pub fn is_paused(&self) -> bool {
        self.transport.is_paused()
    }

    /// Stop for good: the data task is aborted and the sink released
    pub fn stop(&self) {
        self.task.abort();
        self.transport.sink.stop();
        if !self.state.borrow().is_terminal() {
            self.state.send_replace(PipelineState::Stopped);
        }
        debug!(pipeline = self.id, "Pipeline stopped");
    }

    pub fn set_volume(&self, level: f32) {
        self.transport.sink.set_volume(clamp_volume(level));
    }

    /// Position in the media (start offset plus audio played)
    pub fn position(&self) -> Duration {
        self.start + frames_to_duration(self.transport.played_frames())
    }

    pub fn duration(&self) -> MediaDuration {
        self.duration
    }

    /// Validate a seek request; the graph is rebuilt at the returned offset
    pub fn seek_target(&self, position: Duration) -> Result<Duration, PipelineError> {
        match self.duration {
            MediaDuration::Live => Err(PipelineError::NotSeekable),
            MediaDuration::Finite(total) => Ok(position.min(total)),
        }
    }

    /// Open a capture file and attach it behind the shaping stage
    pub fn attach_capture_branch(
        &self,
        format: CaptureFormat,
        path: &Path,
        ffmpeg: &str,
        on_failure: Option<CaptureFailureHook>,
    ) -> Result<CaptureTap, CaptureError> {
        if self.branch.has_capture() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let tap = CaptureTap::open(format, path, ffmpeg, on_failure)?;
        self.branch.attach(&tap)?;
        Ok(tap)
    }

    /// Attach an existing tap (after a rebuild)
    pub fn attach_tap(&self, tap: &CaptureTap) -> Result<(), CaptureError> {
        self.branch.attach(tap)
    }

    pub fn detach_capture_branch(&self) -> bool {
        self.branch.detach()
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.task.abort();
        self.transport.sink.stop();
    }
}

/// Everything the data task owns
struct DataPath {
    shaper: Shaper,
    branch: Arc<BranchPoint>,
    transport: Arc<Transport>,
    state: Arc<watch::Sender<PipelineState>>,
    live: bool,
    stall_timeout: Duration,
}

impl DataPath {
    async fn run(mut self, mut decoded: DecodedStream, first: PcmChunk) {
        self.deliver(first).await;

        loop {
            let item = match self.next_item(&mut decoded).await {
                Ok(item) => item,
                Err(fault) => return self.fault(fault),
            };

            match item {
                Some(Ok(chunk)) => self.deliver(chunk).await,
                Some(Err(e)) => return self.fault(Fault::Stream(e.to_string())),
                None if self.live => return self.fault(Fault::EndOfStream),
                None => {
                    while self.transport.sink.queued() > 0 {
                        sleep(PACE_INTERVAL).await;
                    }
                    info!("Source finished");
                    self.state.send_replace(PipelineState::Ended);
                    return;
                }
            }
        }
    }

    /// Next decoded item. Silence while paused is never a stall.
    async fn next_item(&self, decoded: &mut DecodedStream) -> Result<Option<DecodeItem>, Fault> {
        loop {
            match timeout(self.stall_timeout, decoded.next_chunk()).await {
                Ok(item) => return Ok(item),
                Err(_) if self.transport.is_paused() => continue,
                Err(_) => return Err(Fault::Stall(self.stall_timeout)),
            }
        }
    }

    async fn deliver(&mut self, chunk: PcmChunk) {
        let mut samples = chunk.samples.to_vec();
        self.shaper.process(&mut samples);
        let shaped = PcmChunk::new(samples, chunk.frame_offset);

        self.branch.fan_out(&shaped);

        while self.transport.sink.queued() >= MAX_QUEUED_CHUNKS {
            sleep(PACE_INTERVAL).await;
        }
        self.transport.append(&shaped);
    }

    fn fault(&self, fault: Fault) {
        warn!(%fault, "Pipeline faulted");
        self.state.send_replace(PipelineState::Faulted(fault));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::audio::{EqualizerState, CHUNK_FRAMES, SAMPLE_RATE};
    use crate::testing::{MockDecoder, MockOutput, Script};

    /// Sink whose queue length the test controls
    struct QueueSink(Arc<AtomicUsize>);

    impl OutputSink for QueueSink {
        fn append(&self, _chunk: &PcmChunk) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn queued(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }

        fn set_volume(&self, _volume: f32) {}

        fn pause(&self) {}

        fn resume(&self) {}

        fn stop(&self) {}
    }

    fn backends(decoder: MockDecoder, output: MockOutput) -> Backends {
        Backends {
            decoder: Arc::new(decoder),
            output: Arc::new(output),
        }
    }

    fn params(descriptor: &SourceDescriptor) -> GraphParams<'_> {
        GraphParams {
            descriptor,
            equalizer: EqualizerControl::new(EqualizerState::default()),
            volume: 0.8,
            start: Duration::ZERO,
            stall_timeout: Duration::from_secs(8),
        }
    }

    async fn wait_for_terminal(handle: &mut PipelineHandle) -> PipelineState {
        loop {
            let state = handle.state();
            if state.is_terminal() {
                return state;
            }
            if handle.changed().await.is_none() {
                return handle.state();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_reaches_flowing_and_plays() {
        let output = MockOutput::new();
        let descriptor = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(params(&descriptor), &backends(MockDecoder::endless(), output.clone()))
            .await
            .unwrap();

        assert_eq!(graph.state(), PipelineState::Flowing);
        assert_eq!(output.volume(), 0.8);

        sleep(Duration::from_secs(1)).await;
        assert!(output.frames_played() > SAMPLE_RATE as u64 / 2);
        assert!(output.is_contiguous());
        assert_eq!(graph.duration(), MediaDuration::Live);
    }

    #[test]
    fn test_played_frames_counts_short_chunks() {
        let queued = Arc::new(AtomicUsize::new(0));
        let transport = Transport::new(Box::new(QueueSink(queued.clone())));
        let full = CHUNK_FRAMES as u64;

        transport.append(&PcmChunk::new(vec![0.0; CHUNK_FRAMES * 2], 0));
        transport.append(&PcmChunk::new(vec![0.0; 300 * 2], full));
        transport.append(&PcmChunk::new(vec![0.0; CHUNK_FRAMES * 2], full + 300));
        assert_eq!(transport.played_frames(), 0);

        // The full chunk and the short one have played
        queued.store(1, Ordering::SeqCst);
        assert_eq!(transport.played_frames(), full + 300);

        queued.store(0, Ordering::SeqCst);
        assert_eq!(transport.played_frames(), 2 * full + 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_source_fails_build() {
        let descriptor = SourceDescriptor::live("mock://nowhere");
        let result = PipelineGraph::build(
            params(&descriptor),
            &backends(MockDecoder::scripted(vec![Script::Unreachable]), MockOutput::new()),
        )
        .await;
        assert!(matches!(result, Err(PipelineError::UnsupportedSource { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_error_faults() {
        let descriptor = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(
            params(&descriptor),
            &backends(MockDecoder::scripted(vec![Script::FailAfter(10)]), MockOutput::new()),
        )
        .await
        .unwrap();

        let mut handle = graph.handle();
        assert!(matches!(wait_for_terminal(&mut handle).await, PipelineState::Faulted(Fault::Stream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_end_of_stream_faults() {
        let descriptor = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(
            params(&descriptor),
            &backends(MockDecoder::scripted(vec![Script::EndAfter(5)]), MockOutput::new()),
        )
        .await
        .unwrap();

        let mut handle = graph.handle();
        assert_eq!(
            wait_for_terminal(&mut handle).await,
            PipelineState::Faulted(Fault::EndOfStream)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_source_ends() {
        let descriptor = SourceDescriptor::live("mock://file").with_duration(Duration::from_secs(1));
        let graph = PipelineGraph::build(
            params(&descriptor),
            &backends(MockDecoder::scripted(vec![Script::EndAfter(5)]), MockOutput::new()),
        )
        .await
        .unwrap();

        let mut handle = graph.handle();
        assert_eq!(wait_for_terminal(&mut handle).await, PipelineState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_faults_unless_paused() {
        let descriptor = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(
            params(&descriptor),
            &backends(MockDecoder::scripted(vec![Script::HangAfter(3)]), MockOutput::new()),
        )
        .await
        .unwrap();
        let mut handle = graph.handle();
        assert_eq!(
            wait_for_terminal(&mut handle).await,
            PipelineState::Faulted(Fault::Stall(Duration::from_secs(8)))
        );

        let graph = PipelineGraph::build(
            params(&descriptor),
            &backends(MockDecoder::scripted(vec![Script::HangAfter(3)]), MockOutput::new()),
        )
        .await
        .unwrap();
        graph.pause();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(graph.state(), PipelineState::Flowing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_rules() {
        let output = MockOutput::new();
        let live = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(params(&live), &backends(MockDecoder::endless(), output.clone()))
            .await
            .unwrap();
        assert!(matches!(
            graph.seek_target(Duration::from_secs(10)),
            Err(PipelineError::NotSeekable)
        ));
        assert_eq!(graph.state(), PipelineState::Flowing);

        let finite = SourceDescriptor::live("mock://file").with_duration(Duration::from_secs(120));
        let graph = PipelineGraph::build(params(&finite), &backends(MockDecoder::endless(), output))
            .await
            .unwrap();
        assert_eq!(graph.seek_target(Duration::from_secs(30)).unwrap(), Duration::from_secs(30));
        assert_eq!(graph.seek_target(Duration::from_secs(500)).unwrap(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_terminal() {
        let output = MockOutput::new();
        let descriptor = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(params(&descriptor), &backends(MockDecoder::endless(), output.clone()))
            .await
            .unwrap();
        graph.stop();
        assert_eq!(graph.state(), PipelineState::Stopped);

        let played = output.frames_played();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(output.frames_played(), played);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_attach_detach_keeps_playback_continuous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.wav");
        let output = MockOutput::new();
        let descriptor = SourceDescriptor::live("mock://radio");
        let graph = PipelineGraph::build(params(&descriptor), &backends(MockDecoder::endless(), output.clone()))
            .await
            .unwrap();

        sleep(Duration::from_millis(500)).await;
        let tap = graph
            .attach_capture_branch(CaptureFormat::Wav, &path, "ffmpeg", None)
            .unwrap();
        assert!(matches!(
            graph.attach_capture_branch(CaptureFormat::Wav, &dir.path().join("second.wav"), "ffmpeg", None),
            Err(CaptureError::AlreadyCapturing)
        ));
        sleep(Duration::from_secs(2)).await;
        assert!(graph.detach_capture_branch());
        let summary = tap.finalize().await.unwrap();
        sleep(Duration::from_millis(500)).await;

        assert!(output.is_contiguous());
        assert_eq!(graph.state(), PipelineState::Flowing);
        assert!(summary.frames > 0);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.duration() as u64, summary.frames);
        assert!(!dir.path().join("second.wav").exists());
    }
}
