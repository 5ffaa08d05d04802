use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::CaptureError;

use super::buffer::{samples_to_le_bytes, PcmChunk, CHANNELS, SAMPLE_RATE};

/// How long the encoder may take to write its trailer after input ends
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames that fit in a RIFF file (32-bit sizes, 44-byte header), about 6.2 h
pub const WAV_MAX_FRAMES: u64 = (u32::MAX as u64 - 44) / (CHANNELS as u64 * 2);

/// Capture output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    /// Lossy, high bitrate (MP3 320 kbps)
    #[default]
    Mp3,
    /// Lossless, compressed
    Flac,
    /// Lossless, uncompressed (16-bit PCM)
    Wav,
    /// Lossy, open format (Ogg Vorbis q6)
    Ogg,
}

impl CaptureFormat {
    pub const ALL: [CaptureFormat; 4] = [Self::Mp3, Self::Flac, Self::Wav, Self::Ogg];

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Mp3 => "MP3 (320 kbps)",
            Self::Flac => "FLAC (Lossless)",
            Self::Wav => "WAV (Uncompressed)",
            Self::Ogg => "OGG Vorbis (Quality 6)",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, Self::Flac | Self::Wav)
    }

    /// ffmpeg output codec arguments for this format
    pub fn codec_args(&self) -> &'static [&'static str] {
        match self {
            Self::Mp3 => &["-c:a", "libmp3lame", "-b:a", "320k"],
            Self::Flac => &["-c:a", "flac"],
            Self::Wav => &["-c:a", "pcm_s16le"],
            Self::Ogg => &["-c:a", "libvorbis", "-q:a", "6"],
        }
    }
}

impl std::fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for CaptureFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.extension() == key || (key == "vorbis" && *f == Self::Ogg))
            .ok_or_else(|| CaptureError::UnknownFormat(s.to_string()))
    }
}

/// What the writer task reports once the file is finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSummary {
    pub frames: u64,
}

/// Encoder for one capture file, fed with shaped PCM
pub enum CaptureEncoder {
    Wav {
        writer: hound::WavWriter<BufWriter<File>>,
        path: PathBuf,
    },
    Ffmpeg {
        child: Child,
        stdin: ChildStdin,
        path: PathBuf,
    },
}

impl CaptureEncoder {
    /// Open the output file and start the encoder.
    ///
    /// Unwritable paths fail with `CaptureFile` before anything is spawned.
    #[instrument]
    pub fn create(format: CaptureFormat, path: &Path, ffmpeg: &str) -> Result<Self, CaptureError> {
        if format == CaptureFormat::Wav {
            let spec = hound::WavSpec {
                channels: CHANNELS,
                sample_rate: SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(path, spec).map_err(|e| hound_error(path, e))?;
            return Ok(Self::Wav {
                writer,
                path: path.to_path_buf(),
            });
        }

        // Probe writability ourselves; ffmpeg would only fail on its first write
        File::create(path).map_err(|e| CaptureError::file(path, e))?;

        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-f", "f32le", "-ar"])
            .arg(SAMPLE_RATE.to_string())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .args(["-i", "pipe:0"])
            .args(format.codec_args())
            .arg("-y")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CaptureError::Encoder(format!("Failed to spawn {}: {}", ffmpeg, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Encoder("Failed to get encoder stdin".into()))?;

        Ok(Self::Ffmpeg {
            child,
            stdin,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Wav { path, .. } | Self::Ffmpeg { path, .. } => path,
        }
    }

    /// Run the encoder until the chunk channel closes, then finalize the
    /// container so the file is independently playable.
    pub fn spawn_writer(self, rx: mpsc::UnboundedReceiver<PcmChunk>) -> JoinHandle<Result<EncodeSummary, CaptureError>> {
        match self {
            Self::Wav { writer, path } => {
                tokio::task::spawn_blocking(move || write_wav(writer, &path, rx, WAV_MAX_FRAMES))
            }
            Self::Ffmpeg { child, stdin, path } => tokio::spawn(write_ffmpeg(child, stdin, path, rx)),
        }
    }
}

fn hound_error(path: &Path, e: hound::Error) -> CaptureError {
    match e {
        hound::Error::IoError(io) => CaptureError::file(path, io),
        other => CaptureError::Encoder(other.to_string()),
    }
}

#[inline]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Write until the channel closes or `max_frames` is reached. Hitting the
/// limit still finalizes the file, then reports `WavSizeLimit`.
fn write_wav(
    mut writer: hound::WavWriter<BufWriter<File>>,
    path: &Path,
    mut rx: mpsc::UnboundedReceiver<PcmChunk>,
    max_frames: u64,
) -> Result<EncodeSummary, CaptureError> {
    let mut frames = 0u64;
    let mut full = false;
    while let Some(chunk) = rx.blocking_recv() {
        let room = (max_frames - frames).min(chunk.frame_count() as u64) as usize;
        for &sample in &chunk.samples[..room * CHANNELS as usize] {
            writer.write_sample(to_i16(sample)).map_err(|e| hound_error(path, e))?;
        }
        frames += room as u64;
        if frames == max_frames {
            full = true;
            break;
        }
    }
    drop(rx);

    // Rewrites the RIFF/data sizes
    writer.finalize().map_err(|e| hound_error(path, e))?;
    if full {
        warn!(path = ?path, frames, "WAV capture reached the format size limit");
        return Err(CaptureError::WavSizeLimit(frames));
    }
    info!(path = ?path, frames, "WAV capture finalized");
    Ok(EncodeSummary { frames })
}

async fn write_ffmpeg(
    mut child: Child,
    mut stdin: ChildStdin,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<PcmChunk>,
) -> Result<EncodeSummary, CaptureError> {
    let mut stderr = child.stderr.take();
    let mut frames = 0u64;

    while let Some(chunk) = rx.recv().await {
        let bytes = samples_to_le_bytes(&chunk.samples);
        if let Err(e) = stdin.write_all(&bytes).await {
            error!(error = %e, path = ?path, "Encoder input closed");
            return Err(CaptureError::Encoder(format!("Encoder stopped accepting audio: {}", e)));
        }
        frames += chunk.frame_count() as u64;
    }

    // EOF on stdin: ffmpeg writes the trailer and exits
    drop(stdin);
    debug!(path = ?path, frames, "Waiting for encoder to finalize");

    let status = match timeout(FINALIZE_TIMEOUT, child.wait()).await {
        Ok(status) => status.map_err(|e| CaptureError::Encoder(e.to_string()))?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(CaptureError::Encoder("Encoder did not finish in time".into()));
        }
    };

    if !status.success() {
        let mut message = String::new();
        if let Some(stderr) = stderr.as_mut() {
            let _ = stderr.read_to_string(&mut message).await;
        }
        error!(%status, stderr = %message, "Capture encoder failed");
        return Err(CaptureError::Encoder(format!("Encoder exited with {}: {}", status, message.trim())));
    }

    info!(path = ?path, frames, "Capture finalized");
    Ok(EncodeSummary { frames })
}
