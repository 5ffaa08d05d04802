use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{CaptureEncoder, CaptureFormat, EncodeSummary, PcmChunk};
use crate::error::CaptureError;

/// Called with the file path when a capture writer fails (disk full, encoder crash)
pub type CaptureFailureHook = Arc<dyn Fn(&Path, &CaptureError) + Send + Sync>;

static NEXT_TAP_ID: AtomicU64 = AtomicU64::new(1);

/// Split point after the shaping stage.
///
/// Playback is fed by the data task directly; this holds the optional
/// capture endpoint. Attach, detach and fan-out all take the same lock,
/// so a chunk goes either entirely to the old endpoint or not at all.
#[derive(Default)]
pub struct BranchPoint {
    capture: Mutex<Option<Endpoint>>,
    attaches: AtomicU64,
}

struct Endpoint {
    tap_id: u64,
    tx: mpsc::UnboundedSender<PcmChunk>,
}

impl BranchPoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the capture endpoint of `tap`
    pub fn attach(&self, tap: &CaptureTap) -> Result<(), CaptureError> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }
        *capture = Some(Endpoint {
            tap_id: tap.id,
            tx: tap.tx.clone(),
        });
        self.attaches.fetch_add(1, Ordering::Relaxed);
        debug!(tap = tap.id, "Capture branch attached");
        Ok(())
    }

    /// Remove the capture endpoint. Returns whether one was attached.
    pub fn detach(&self) -> bool {
        let removed = self.capture.lock().take();
        if let Some(endpoint) = &removed {
            debug!(tap = endpoint.tap_id, "Capture branch detached");
        }
        removed.is_some()
    }

    pub fn has_capture(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// How many times a capture endpoint was attached over this graph's life
    pub fn attach_count(&self) -> u64 {
        self.attaches.load(Ordering::Relaxed)
    }

    /// Offer a shaped chunk to the capture endpoint
    pub fn fan_out(&self, chunk: &PcmChunk) {
        let mut capture = self.capture.lock();
        if let Some(endpoint) = capture.as_ref() {
            if endpoint.tx.send(chunk.clone()).is_err() {
                // Writer is gone; it reports its own failure
                warn!(tap = endpoint.tap_id, "Capture writer closed, dropping branch");
                *capture = None;
            }
        }
    }
}

/// A capture sink: the sending end of the branch plus its writer task.
///
/// The tap outlives any single graph, so a branch-tap capture survives
/// reconnection by attaching the same tap to the rebuilt graph.
pub struct CaptureTap {
    id: u64,
    tx: mpsc::UnboundedSender<PcmChunk>,
    writer: JoinHandle<Result<EncodeSummary, CaptureError>>,
    path: PathBuf,
    format: CaptureFormat,
}

impl CaptureTap {
    /// Open the output file and start the writer task
    pub fn open(
        format: CaptureFormat,
        path: &Path,
        ffmpeg: &str,
        on_failure: Option<CaptureFailureHook>,
    ) -> Result<Self, CaptureError> {
        let encoder = CaptureEncoder::create(format, path, ffmpeg)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = encoder.spawn_writer(rx);
        let id = NEXT_TAP_ID.fetch_add(1, Ordering::Relaxed);

        let hook_path = path.to_path_buf();
        let writer = tokio::spawn(async move {
            let result = match inner.await {
                Ok(result) => result,
                Err(e) => Err(CaptureError::Encoder(format!("Capture writer crashed: {}", e))),
            };
            if let Err(e) = &result {
                error!(tap = id, error = %e, "Capture writer failed");
                if let Some(hook) = &on_failure {
                    hook(&hook_path, e);
                }
            }
            result
        });

        info!(tap = id, path = ?path, %format, "Capture tap opened");
        Ok(Self {
            id,
            tx,
            writer,
            path: path.to_path_buf(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Whether the writer has stopped (only happens early on failure)
    pub fn is_finished(&self) -> bool {
        self.writer.is_finished()
    }

    /// Close the branch, let the writer drain what is in flight, and
    /// finalize the container. Detach from the graph before calling.
    pub async fn finalize(self) -> Result<EncodeSummary, CaptureError> {
        drop(self.tx);
        match self.writer.await {
            Ok(result) => result,
            Err(e) => Err(CaptureError::Encoder(format!("Capture writer crashed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn chunk(offset: u64) -> PcmChunk {
        PcmChunk::new(vec![0.1; 512], offset)
    }

    #[tokio::test]
    async fn test_second_attach_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let branch = BranchPoint::new();
        let a = CaptureTap::open(CaptureFormat::Wav, &dir.path().join("a.wav"), "ffmpeg", None).unwrap();
        let b = CaptureTap::open(CaptureFormat::Wav, &dir.path().join("b.wav"), "ffmpeg", None).unwrap();

        branch.attach(&a).unwrap();
        assert!(matches!(branch.attach(&b), Err(CaptureError::AlreadyCapturing)));
        assert_eq!(branch.attach_count(), 1);

        assert!(branch.detach());
        assert!(!branch.detach());
        a.finalize().await.unwrap();
        b.finalize().await.unwrap();
    }

    #[tokio::test]
    async fn test_only_attached_chunks_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tap.wav");
        let branch = BranchPoint::new();

        branch.fan_out(&chunk(0));
        let tap = CaptureTap::open(CaptureFormat::Wav, &path, "ffmpeg", None).unwrap();
        branch.attach(&tap).unwrap();
        branch.fan_out(&chunk(256));
        branch.fan_out(&chunk(512));
        branch.detach();
        branch.fan_out(&chunk(768));

        let summary = tap.finalize().await.unwrap();
        assert_eq!(summary.frames, 512);
        assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 512);
    }

    #[tokio::test]
    async fn test_writer_failure_runs_hook_and_drops_branch() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: CaptureFailureHook = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // An encoder that exits immediately
        let tap = CaptureTap::open(CaptureFormat::Mp3, &dir.path().join("x.mp3"), "false", Some(hook)).unwrap();
        let branch = BranchPoint::new();
        branch.attach(&tap).unwrap();

        for i in 0..200 {
            branch.fan_out(&chunk(i * 256));
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if !branch.has_capture() {
                break;
            }
        }

        assert!(tap.finalize().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
