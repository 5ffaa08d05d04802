use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::PipelineError;

use super::buffer::{samples_from_le_bytes, PcmChunk, CHANNELS, CHUNK_FRAMES, SAMPLE_RATE};
use super::stream::{pump, SourceOpener, StreamTags};

/// Decoded chunks buffered between the decoder and the data path
const DECODED_QUEUE: usize = 32;

/// Bytes per decoded chunk (f32 interleaved)
const CHUNK_BYTES: usize = CHUNK_FRAMES * CHANNELS as usize * 4;

/// Item produced by a decoder: a chunk of audio or a stream fault
pub type DecodeItem = Result<PcmChunk, PipelineError>;

/// A running decode stage. Dropping it tears down every task (and
/// subprocess) feeding it.
pub struct DecodedStream {
    rx: mpsc::Receiver<DecodeItem>,
    tags: watch::Receiver<StreamTags>,
    tasks: Vec<JoinHandle<()>>,
}

impl DecodedStream {
    /// `tags` carries the station tags, updated whenever the stream announces a new track
    pub fn new(rx: mpsc::Receiver<DecodeItem>, tags: watch::Receiver<StreamTags>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { rx, tags, tasks }
    }

    /// Next decoded chunk; `None` once the source has ended cleanly
    pub async fn next_chunk(&mut self) -> Option<DecodeItem> {
        self.rx.recv().await
    }

    pub fn tags(&self) -> watch::Receiver<StreamTags> {
        self.tags.clone()
    }
}

impl Drop for DecodedStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Source + decode + convert/resample stage.
///
/// Output is always interleaved f32 at [`SAMPLE_RATE`] / [`CHANNELS`].
pub trait Decoder: Send + Sync {
    /// Open `locator` and start decoding from `start`.
    ///
    /// Fails with `UnsupportedSource` when the locator cannot be opened and
    /// `DecodeInit` when no decoder can be started.
    fn open<'a>(&'a self, locator: &'a str, start: Duration) -> BoxFuture<'a, Result<DecodedStream, PipelineError>>;
}

/// Decoder using an ffmpeg subprocess fed from the network stream
pub struct FfmpegDecoder {
    ffmpeg: String,
    opener: SourceOpener,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg: impl Into<String>, opener: SourceOpener) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            opener,
        }
    }

    fn args(start: Duration) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-i", "pipe:0"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // Output seeking: decode and discard up to the position
        if !start.is_zero() {
            args.push("-ss".into());
            args.push(format!("{:.3}", start.as_secs_f64()));
        }

        args.extend(["-vn", "-f", "f32le", "-acodec", "pcm_f32le"].iter().map(|s| s.to_string()));
        args.push("-ar".into());
        args.push(SAMPLE_RATE.to_string());
        args.push("-ac".into());
        args.push(CHANNELS.to_string());
        args.push("pipe:1".into());
        args
    }

    #[instrument(skip(self))]
    async fn open_stream(&self, locator: &str, start: Duration) -> Result<DecodedStream, PipelineError> {
        let (source, tags) = self.opener.open(locator).await?;

        let mut child = Command::new(&self.ffmpeg)
            .args(Self::args(start))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    PipelineError::DecodeInit(format!("{} not found - please install ffmpeg", self.ffmpeg))
                }
                _ => PipelineError::DecodeInit(format!("Failed to spawn ffmpeg: {}", e)),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::DecodeInit("Failed to get ffmpeg stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::DecodeInit("Failed to get ffmpeg stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::DecodeInit("Failed to get ffmpeg stderr".into()))?;

        let (tx, rx) = mpsc::channel(DECODED_QUEUE);
        let (tags_tx, tags_rx) = watch::channel(tags);

        // Network -> ffmpeg stdin
        let feeder_tx = tx.clone();
        let feeder = tokio::spawn(async move {
            match pump(source, &mut stdin, &tags_tx).await {
                Ok(bytes) => debug!(bytes, "Source ended"),
                Err(e) => {
                    warn!(error = %e, "Source pump failed");
                    let _ = feeder_tx.send(Err(e)).await;
                }
            }
            // Closing stdin lets ffmpeg flush and exit
            drop(stdin);
        });

        // ffmpeg stdout -> chunks; owns the child so aborting kills it
        let reader = tokio::spawn(async move {
            let (frames, stderr_output) = tokio::join!(read_chunks(stdout, &tx), read_stderr(stderr));

            let frames = match frames {
                Ok(frames) => frames,
                // receiver gone: the pipeline was torn down
                Err(ReadStop::Closed) => return,
                Err(ReadStop::Io(e)) => {
                    let _ = tx.send(Err(PipelineError::Stream(format!("Decoder read failed: {}", e)))).await;
                    return;
                }
            };

            match child.wait().await {
                Ok(status) if status.success() => debug!(frames, "Decoder finished"),
                Ok(status) => {
                    error!(%status, stderr = %stderr_output, "ffmpeg failed");
                    let fault = if frames == 0 {
                        PipelineError::DecodeInit(first_line(&stderr_output, "ffmpeg produced no audio"))
                    } else {
                        PipelineError::Stream(format!("Decoder exited with {}", status))
                    };
                    let _ = tx.send(Err(fault)).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(PipelineError::Stream(e.to_string()))).await;
                }
            }
        });

        Ok(DecodedStream::new(rx, tags_rx, vec![feeder, reader]))
    }
}

impl Decoder for FfmpegDecoder {
    fn open<'a>(&'a self, locator: &'a str, start: Duration) -> BoxFuture<'a, Result<DecodedStream, PipelineError>> {
        Box::pin(self.open_stream(locator, start))
    }
}

enum ReadStop {
    Closed,
    Io(std::io::Error),
}

/// Read raw f32le PCM into fixed-size chunks. Returns the frames produced.
async fn read_chunks<R>(mut reader: R, tx: &mpsc::Sender<DecodeItem>) -> Result<u64, ReadStop>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut filled = 0usize;
    let mut frames = 0u64;

    loop {
        let n = reader.read(&mut buf[filled..]).await.map_err(ReadStop::Io)?;
        filled += n;

        let eof = n == 0;
        if filled == CHUNK_BYTES || (eof && filled > 0) {
            // keep only whole frames
            let usable = filled - filled % (CHANNELS as usize * 4);
            let samples = samples_from_le_bytes(&buf[..usable]);
            let chunk = PcmChunk::new(samples, frames);
            frames = chunk.end_offset();
            tx.send(Ok(chunk)).await.map_err(|_| ReadStop::Closed)?;
            filled = 0;
        }

        if eof {
            return Ok(frames);
        }
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut output = Vec::new();
    let _ = reader.read_to_end(&mut output).await;
    String::from_utf8_lossy(&output).into_owned()
}

fn first_line(text: &str, fallback: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::samples_to_le_bytes;

    #[test]
    fn test_ffmpeg_args_without_seek() {
        let args = FfmpegDecoder::args(Duration::ZERO);
        assert!(!args.contains(&"-ss".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(args.windows(2).any(|w| w[0] == "-ar" && w[1] == "48000"));
    }

    #[test]
    fn test_ffmpeg_args_with_seek_after_input() {
        let args = FfmpegDecoder::args(Duration::from_millis(90_500));
        let input = args.iter().position(|a| a == "pipe:0").unwrap();
        let seek = args.iter().position(|a| a == "-ss").unwrap();
        assert!(seek > input, "seek must be an output option");
        assert_eq!(args[seek + 1], "90.500");
    }

    #[tokio::test]
    async fn test_read_chunks_splits_and_keeps_offsets() {
        // 2.5 chunks worth of frames
        let total_frames = CHUNK_FRAMES * 5 / 2;
        let samples: Vec<f32> = (0..total_frames * 2).map(|i| i as f32 / 1e6).collect();
        let bytes = samples_to_le_bytes(&samples);

        let (tx, mut rx) = mpsc::channel(16);
        let frames = match read_chunks(&bytes[..], &tx).await {
            Ok(frames) => frames,
            Err(_) => panic!("read failed"),
        };
        drop(tx);
        assert_eq!(frames, total_frames as u64);

        let mut expected_offset = 0;
        let mut collected = Vec::new();
        while let Some(item) = rx.recv().await {
            let chunk = item.unwrap();
            assert_eq!(chunk.frame_offset, expected_offset);
            expected_offset = chunk.end_offset();
            collected.extend_from_slice(&chunk.samples);
        }
        assert_eq!(collected, samples);
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_decode_init() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.mp3");
        std::fs::write(&path, b"not really audio").unwrap();

        let opener = SourceOpener::new(Duration::from_secs(1)).unwrap();
        let decoder = FfmpegDecoder::new("/nonexistent/ffmpeg-binary", opener);
        let err = decoder.open(path.to_str().unwrap(), Duration::ZERO).await.err().unwrap();
        assert!(matches!(err, PipelineError::DecodeInit(_)));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("\n  Invalid data found\nmore", "x"), "Invalid data found");
        assert_eq!(first_line("", "fallback"), "fallback");
    }
}
