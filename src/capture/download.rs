use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::audio::CaptureFormat;
use crate::error::CaptureError;

/// How long the encoder may take to finish after its input closes
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// Best audio of `page_url` written to stdout
    pub fn downloader(ytdlp: &str, page_url: &str) -> Self {
        Self {
            program: ytdlp.to_string(),
            args: ["-f", "bestaudio/best", "--no-playlist", "--no-part", "--quiet", "-o", "-", "--", page_url]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Transcode whatever arrives on stdin into `path`
    pub fn transcoder(ffmpeg: &str, format: CaptureFormat, path: &Path) -> Self {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(format.codec_args().iter().map(|s| s.to_string()));
        args.push("-y".into());
        args.push(path.to_string_lossy().into_owned());
        Self {
            program: ffmpeg.to_string(),
            args,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        command
    }
}

/// How a download ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Stopped on request before the downloader finished
    pub interrupted: bool,
    /// The downloader exited successfully on its own
    pub downloader_ok: bool,
    /// The encoder exited successfully within the finalize window
    pub encoder_ok: bool,
}

impl DownloadOutcome {
    /// Complete, cleanly closed file
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.downloader_ok && self.encoder_ok
    }
}

/// Called with the file path once a download finishes without being stopped
pub type CompletionHook = Arc<dyn Fn(&Path, DownloadOutcome) + Send + Sync>;

/// Downloader piped into an encoder, running in the background.
///
/// Controlled by message passing: a stop signal in, the outcome out.
pub struct BackgroundDownload {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<DownloadOutcome>,
    downloader: ProcessSpec,
    path: PathBuf,
}

impl BackgroundDownload {
    /// Spawn both processes and start copying between them
    #[instrument(skip_all, fields(path = ?path))]
    pub fn spawn(
        downloader: ProcessSpec,
        encoder: ProcessSpec,
        path: &Path,
        on_complete: Option<CompletionHook>,
    ) -> Result<Self, CaptureError> {
        // Probe writability ourselves; the encoder only fails once data arrives
        std::fs::File::create(path).map_err(|e| CaptureError::file(path, e))?;

        let mut download_child = downloader
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::Download(format!("Failed to start {}: {}", downloader.program, e)))?;

        let encoder_child = encoder
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::Encoder(format!("Failed to start {}: {}", encoder.program, e)))?;

        let stdout = download_child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Download("Failed to get downloader stdout".into()))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let hook_path = path.to_path_buf();
        let task = tokio::spawn(async move {
            let outcome = supervise(download_child, stdout, encoder_child, stop_rx).await;
            if !outcome.interrupted {
                if let Some(hook) = &on_complete {
                    hook(&hook_path, outcome);
                }
            }
            outcome
        });

        info!(program = %downloader.program, "Background download started");
        Ok(Self {
            stop_tx: Some(stop_tx),
            task,
            downloader,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The downloader invocation (the page it was pointed at)
    pub fn downloader(&self) -> &ProcessSpec {
        &self.downloader
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Terminate the downloader and wait for the encoder to close the file
    pub async fn stop(mut self) -> Result<DownloadOutcome, CaptureError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Fails only if the download already finished
            let _ = stop_tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| CaptureError::Download(format!("Download task crashed: {}", e)))
    }
}

impl Drop for BackgroundDownload {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

async fn supervise(
    mut downloader: Child,
    mut stdout: tokio::process::ChildStdout,
    mut encoder: Child,
    mut stop_rx: oneshot::Receiver<()>,
) -> DownloadOutcome {
    let mut stdin = encoder.stdin.take();

    let interrupted = match stdin.as_mut() {
        Some(stdin) => {
            tokio::select! {
                copied = tokio::io::copy(&mut stdout, stdin) => {
                    match copied {
                        Ok(bytes) => debug!(bytes, "Downloader finished"),
                        Err(e) => warn!(error = %e, "Download pipe broke"),
                    }
                    false
                }
                _ = &mut stop_rx => true,
            }
        }
        None => false,
    };

    if interrupted {
        debug!("Stopping downloader");
        let _ = downloader.kill().await;
    }
    let downloader_status = downloader.wait().await.ok();

    // End of input: the encoder writes its trailer and exits
    drop(stdin);
    drop(stdout);
    let encoder_status = match timeout(FINALIZE_TIMEOUT, encoder.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!("Encoder did not finish in time, killing it");
            let _ = encoder.kill().await;
            None
        }
    };

    let outcome = DownloadOutcome {
        interrupted,
        downloader_ok: succeeded(downloader_status),
        encoder_ok: succeeded(encoder_status),
    };
    info!(?outcome, "Background download ended");
    outcome
}

fn succeeded(status: Option<ExitStatus>) -> bool {
    status.map(|s| s.success()).unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn writer(path: &Path) -> ProcessSpec {
        sh(&format!("cat > '{}'", path.display()))
    }

    #[test]
    fn test_downloader_uses_page_url() {
        let spec = ProcessSpec::downloader("yt-dlp", "https://www.youtube.com/watch?v=abc");
        assert_eq!(spec.program, "yt-dlp");
        assert_eq!(spec.args.last().map(String::as_str), Some("https://www.youtube.com/watch?v=abc"));
        assert!(spec.args.windows(2).any(|w| w[0] == "-o" && w[1] == "-"));
    }

    #[test]
    fn test_transcoder_args() {
        let spec = ProcessSpec::transcoder("ffmpeg", CaptureFormat::Ogg, Path::new("/tmp/x.ogg"));
        assert!(spec.args.contains(&"libvorbis".to_string()));
        assert_eq!(spec.args.last().map(String::as_str), Some("/tmp/x.ogg"));
    }

    #[tokio::test]
    async fn test_stop_interrupts_and_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let download = BackgroundDownload::spawn(
            sh("while :; do printf 'audio-bytes'; sleep 0.02; done"),
            writer(&path),
            &path,
            None,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!download.is_finished());
        let outcome = download.stop().await.unwrap();

        assert!(outcome.interrupted);
        assert!(!outcome.is_complete());
        assert!(outcome.encoder_ok);
        let written = std::fs::read(&path).unwrap();
        assert!(written.starts_with(b"audio-bytes"));
    }

    #[tokio::test]
    async fn test_natural_completion_runs_hook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.bin");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hook: CompletionHook = Arc::new(move |_, outcome| {
            assert!(outcome.is_complete());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let download = BackgroundDownload::spawn(sh("printf 'whole-file'"), writer(&path), &path, Some(hook)).unwrap();
        for _ in 0..100 {
            if download.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let outcome = download.stop().await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"whole-file");
    }

    #[tokio::test]
    async fn test_missing_downloader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mp3");
        let spec = ProcessSpec::downloader("/nonexistent/yt-dlp", "https://example.com/v");
        let err = BackgroundDownload::spawn(spec, writer(&path), &path, None).err().unwrap();
        assert!(matches!(err, CaptureError::Download(_)));
    }
}
