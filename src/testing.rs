//! In-memory decoder and output backends for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::audio::{frames_to_duration, DecodeItem, DecodedStream, Decoder, PcmChunk, StreamTags, CHUNK_FRAMES, SAMPLE_RATE};
use crate::error::{PipelineError, ResolveError};
use crate::playback::{AudioOutput, OutputSink};
use crate::source::{Resolver, SourceDescriptor, SourceMetadata};

/// Behaviour of one `open` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Script {
    /// Produce audio forever
    Play,
    /// Fail to open (connection refused)
    Unreachable,
    /// Open, then fail with a stream error after n chunks
    FailAfter(usize),
    /// Open, then end cleanly after n chunks
    EndAfter(usize),
    /// Open, then go silent after n chunks without closing
    HangAfter(usize),
}

/// Decoder producing a real-time sine, driven by a script per open
pub struct MockDecoder {
    scripts: Mutex<VecDeque<Script>>,
    frequency: f32,
    amplitude: f32,
    /// (artist, title) announced in turn, one every `title_every` chunks
    titles: Vec<(Option<String>, String)>,
    title_every: usize,
    opens: AtomicUsize,
    starts: Mutex<Vec<Duration>>,
    locators: Mutex<Vec<String>>,
}

impl MockDecoder {
    /// Every open plays forever
    pub fn endless() -> Self {
        Self::scripted(Vec::new())
    }

    /// Opens follow `scripts` in order, then play forever
    pub fn scripted(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            frequency: 440.0,
            amplitude: 0.25,
            titles: Vec::new(),
            title_every: 0,
            opens: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            locators: Mutex::new(Vec::new()),
        }
    }

    pub fn with_frequency(mut self, frequency: f32) -> Self {
        self.frequency = frequency;
        self
    }

    /// Announce in-stream track titles, one every `every` chunks
    pub fn with_stream_titles(mut self, titles: &[(Option<&str>, &str)], every: usize) -> Self {
        self.titles = titles
            .iter()
            .map(|(artist, title)| (artist.map(str::to_string), title.to_string()))
            .collect();
        self.title_every = every.max(1);
        self
    }

    /// Queue more scripts for later opens
    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<Duration> {
        self.starts.lock().clone()
    }

    pub fn locators(&self) -> Vec<String> {
        self.locators.lock().clone()
    }
}

impl Decoder for MockDecoder {
    fn open<'a>(&'a self, locator: &'a str, start: Duration) -> BoxFuture<'a, Result<DecodedStream, PipelineError>> {
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Play);
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().push(start);
        self.locators.lock().push(locator.to_string());
        let signal = Signal {
            frequency: self.frequency,
            amplitude: self.amplitude,
            titles: self.titles.clone(),
            title_every: self.title_every,
        };

        Box::pin(async move {
            if script == Script::Unreachable {
                return Err(PipelineError::unsupported(locator, "connection refused"));
            }
            let (tx, rx) = mpsc::channel(4);
            let (tags_tx, tags_rx) = watch::channel(StreamTags {
                name: Some("Mock FM".into()),
                ..Default::default()
            });
            let task = tokio::spawn(produce(tx, tags_tx, script, signal));
            Ok(DecodedStream::new(rx, tags_rx, vec![task]))
        })
    }
}

/// Interleaved stereo sine chunk, phase-continuous across offsets
pub fn sine_chunk(frequency: f32, amplitude: f32, frame_offset: u64) -> PcmChunk {
    let samples = (0..CHUNK_FRAMES as u64)
        .flat_map(|i| {
            let t = (frame_offset + i) as f64 / SAMPLE_RATE as f64;
            let s = ((2.0 * std::f64::consts::PI * frequency as f64 * t).sin() as f32) * amplitude;
            [s, s]
        })
        .collect();
    PcmChunk::new(samples, frame_offset)
}

struct Signal {
    frequency: f32,
    amplitude: f32,
    titles: Vec<(Option<String>, String)>,
    title_every: usize,
}

async fn produce(tx: mpsc::Sender<DecodeItem>, tags: watch::Sender<StreamTags>, script: Script, signal: Signal) {
    let limit = match script {
        Script::FailAfter(n) | Script::EndAfter(n) | Script::HangAfter(n) => Some(n),
        Script::Play | Script::Unreachable => None,
    };
    let mut offset = 0u64;
    let mut produced = 0usize;

    loop {
        if limit == Some(produced) {
            match script {
                Script::FailAfter(_) => {
                    let _ = tx.send(Err(PipelineError::Stream("connection reset".into()))).await;
                }
                Script::HangAfter(_) => {
                    // keeps the channel open
                    std::future::pending::<()>().await;
                }
                _ => {}
            }
            return;
        }

        if signal.title_every > 0 && produced % signal.title_every == 0 {
            if let Some((artist, title)) = signal.titles.get(produced / signal.title_every) {
                tags.send_modify(|t| {
                    t.artist = artist.clone();
                    t.title = Some(title.clone());
                });
            }
        }
        if tx.send(Ok(sine_chunk(signal.frequency, signal.amplitude, offset))).await.is_err() {
            return;
        }
        offset += CHUNK_FRAMES as u64;
        produced += 1;
        sleep(frames_to_duration(CHUNK_FRAMES as u64)).await;
    }
}

#[derive(Default)]
struct OutputLog {
    /// (frame offset, frames) per opened sink
    sinks: Vec<Vec<(u64, usize)>>,
    volume: f32,
    paused: bool,
    /// Sinks opened and not yet stopped or dropped
    live: usize,
    max_live: usize,
}

/// Output that consumes audio instantly and records what it got
#[derive(Clone, Default)]
pub struct MockOutput {
    log: Arc<Mutex<OutputLog>>,
}

impl MockOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sinks_opened(&self) -> usize {
        self.log.lock().sinks.len()
    }

    pub fn frames_played(&self) -> u64 {
        self.log
            .lock()
            .sinks
            .iter()
            .flatten()
            .map(|(_, frames)| *frames as u64)
            .sum()
    }

    /// Whether every sink received gap-free, in-order audio
    pub fn is_contiguous(&self) -> bool {
        self.log.lock().sinks.iter().all(|chunks| {
            chunks
                .windows(2)
                .all(|w| w[0].0 + w[0].1 as u64 == w[1].0)
        })
    }

    pub fn volume(&self) -> f32 {
        self.log.lock().volume
    }

    pub fn is_paused(&self) -> bool {
        self.log.lock().paused
    }

    pub fn live_sinks(&self) -> usize {
        self.log.lock().live
    }

    /// Most sinks that were ever open at the same time
    pub fn max_live_sinks(&self) -> usize {
        self.log.lock().max_live
    }
}

impl AudioOutput for MockOutput {
    fn open_sink(&self) -> Result<Box<dyn OutputSink>, PipelineError> {
        let mut log = self.log.lock();
        log.sinks.push(Vec::new());
        log.paused = false;
        log.live += 1;
        log.max_live = log.max_live.max(log.live);
        Ok(Box::new(MockSink {
            log: self.log.clone(),
            index: log.sinks.len() - 1,
            released: AtomicBool::new(false),
        }))
    }
}

struct MockSink {
    log: Arc<Mutex<OutputLog>>,
    index: usize,
    released: AtomicBool,
}

impl MockSink {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.log.lock().live -= 1;
        }
    }
}

impl Drop for MockSink {
    fn drop(&mut self) {
        self.release();
    }
}

impl OutputSink for MockSink {
    fn append(&self, chunk: &PcmChunk) {
        self.log.lock().sinks[self.index].push((chunk.frame_offset, chunk.frame_count()));
    }

    fn queued(&self) -> usize {
        0
    }

    fn set_volume(&self, volume: f32) {
        self.log.lock().volume = volume;
    }

    fn pause(&self) {
        self.log.lock().paused = true;
    }

    fn resume(&self) {
        self.log.lock().paused = false;
    }

    fn stop(&self) {
        self.release();
    }
}

/// Resolver that maps every page to an expiring locator on a fake CDN
#[derive(Default)]
pub struct StaticResolver {
    calls: AtomicUsize,
    fail: bool,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(
        &'a self,
        page_url: &'a str,
        metadata: &'a SourceMetadata,
    ) -> BoxFuture<'a, Result<SourceDescriptor, ResolveError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            if self.fail {
                return Err(ResolveError::Failed("video unavailable".into()));
            }
            // A fresh signature per resolution, like a real CDN
            Ok(SourceDescriptor {
                locator: format!("https://cdn.example/audio?sig={}&src={}", call, page_url.len()),
                time_limited: true,
                metadata: metadata.clone(),
                stable_reference: Some(page_url.to_string()),
                duration: None,
            })
        })
    }
}
