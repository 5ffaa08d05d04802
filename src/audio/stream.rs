use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::PipelineError;

const USER_AGENT: &str = concat!("webradio-engine/", env!("CARGO_PKG_VERSION"));

/// Read size when streaming a local file into the decoder
const FILE_READ_CHUNK: usize = 16 * 1024;

/// Tags announced by the server: station headers, plus the current
/// track from in-stream metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamTags {
    pub name: Option<String>,
    pub genre: Option<String>,
    pub content_type: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// An opened source, ready to be pumped into the decoder
pub enum OpenedSource {
    Http {
        response: reqwest::Response,
        /// Audio bytes between ICY metadata blocks, when the server interleaves them
        metaint: Option<usize>,
    },
    File(tokio::fs::File),
}

/// Opens network (and local) audio sources
#[derive(Clone)]
pub struct SourceOpener {
    client: Client,
}

impl SourceOpener {
    pub fn new(connect_timeout: Duration) -> Result<Self, PipelineError> {
        // No overall timeout: live streams never finish
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| PipelineError::Device(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Open a locator: http(s) URLs, file:// URLs, or plain paths
    #[instrument(skip(self))]
    pub async fn open(&self, locator: &str) -> Result<(OpenedSource, StreamTags), PipelineError> {
        if let Some(path) = local_path(locator) {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| PipelineError::unsupported(locator, e))?;
            debug!(path = ?path, "Opened local source");
            return Ok((OpenedSource::File(file), StreamTags::default()));
        }

        let response = self
            .client
            .get(locator)
            .header("Icy-MetaData", "1")
            .send()
            .await
            .map_err(|e| PipelineError::unsupported(locator, e))?;

        if !response.status().is_success() {
            return Err(PipelineError::unsupported(
                locator,
                format!("HTTP status {}", response.status()),
            ));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let tags = StreamTags {
            name: header("icy-name"),
            genre: header("icy-genre"),
            content_type: header(reqwest::header::CONTENT_TYPE.as_str()),
            ..Default::default()
        };
        let metaint = header("icy-metaint")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0);
        debug!(?tags, ?metaint, "Stream opened");

        Ok((OpenedSource::Http { response, metaint }, tags))
    }
}

fn local_path(locator: &str) -> Option<PathBuf> {
    if let Some(rest) = locator.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if locator.contains("://") {
        return None;
    }
    Some(PathBuf::from(locator))
}

/// Copy an opened source into a writer (the decoder's stdin) until the
/// source ends. ICY metadata is stripped from the audio and published on
/// `tags`. Errors are transient stream faults.
pub async fn pump<W>(source: OpenedSource, writer: &mut W, tags: &watch::Sender<StreamTags>) -> Result<u64, PipelineError>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    match source {
        OpenedSource::Http { response, metaint } => {
            let mut demuxer = metaint.map(IcyDemuxer::new);
            let mut audio = Vec::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let data = chunk.map_err(|e| {
                    warn!(error = %e, "Stream chunk error");
                    PipelineError::Stream(e.to_string())
                })?;

                let data = match demuxer.as_mut() {
                    Some(demuxer) => {
                        audio.clear();
                        for block in demuxer.feed(&data, &mut audio) {
                            publish_title(tags, &block);
                        }
                        &audio[..]
                    }
                    None => &data[..],
                };
                write_all(writer, data).await?;
                total += data.len() as u64;
            }
        }
        OpenedSource::File(mut file) => {
            total = pump_reader(&mut file, writer).await?;
        }
    }
    Ok(total)
}

/// Update the track tags from one metadata block; unchanged titles are not republished
fn publish_title(tags: &watch::Sender<StreamTags>, block: &str) {
    let Some(track) = parse_stream_title(block) else {
        return;
    };
    let changed = tags.send_if_modified(|current| {
        if current.title.as_ref() == Some(&track.title) && current.artist == track.artist {
            return false;
        }
        current.title = Some(track.title.clone());
        current.artist = track.artist.clone();
        true
    });
    if changed {
        info!(title = %track.title, artist = ?track.artist, "Stream title changed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcyState {
    /// Audio bytes left before the next length byte
    Audio(usize),
    Length,
    /// Metadata bytes left in the current block
    Meta(usize),
}

/// Splits a Shoutcast/Icecast stream into audio and metadata blocks.
///
/// Every `metaint` audio bytes the server inserts one length byte `n`
/// followed by `n * 16` bytes of text such as `StreamTitle='A - B';`,
/// NUL padded. Blocks may straddle network chunks.
pub struct IcyDemuxer {
    metaint: usize,
    state: IcyState,
    meta: Vec<u8>,
}

impl IcyDemuxer {
    pub fn new(metaint: usize) -> Self {
        Self {
            metaint,
            state: IcyState::Audio(metaint),
            meta: Vec::new(),
        }
    }

    /// Append the audio part of `data` to `audio`; returns the metadata
    /// blocks completed by it
    pub fn feed(&mut self, mut data: &[u8], audio: &mut Vec<u8>) -> Vec<String> {
        let mut blocks = Vec::new();
        while !data.is_empty() {
            match self.state {
                IcyState::Audio(left) => {
                    let n = left.min(data.len());
                    audio.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    self.state = if n == left { IcyState::Length } else { IcyState::Audio(left - n) };
                }
                IcyState::Length => {
                    let len = data[0] as usize * 16;
                    data = &data[1..];
                    self.meta.clear();
                    self.state = if len == 0 { IcyState::Audio(self.metaint) } else { IcyState::Meta(len) };
                }
                IcyState::Meta(left) => {
                    let n = left.min(data.len());
                    self.meta.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    if n == left {
                        let text = String::from_utf8_lossy(&self.meta);
                        blocks.push(text.trim_end_matches('\0').to_string());
                        self.state = IcyState::Audio(self.metaint);
                    } else {
                        self.state = IcyState::Meta(left - n);
                    }
                }
            }
        }
        blocks
    }
}

/// Track announced in a metadata block
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTitle {
    pub artist: Option<String>,
    pub title: String,
}

/// Parse `StreamTitle='Artist - Title';`. Titles without a separator have no artist.
pub fn parse_stream_title(block: &str) -> Option<StreamTitle> {
    const KEY: &str = "StreamTitle='";
    let rest = &block[block.find(KEY)? + KEY.len()..];
    let end = rest.find("';").or_else(|| rest.rfind('\'')).unwrap_or(rest.len());
    let value = rest[..end].trim();
    if value.is_empty() {
        return None;
    }

    match value.split_once(" - ") {
        Some((artist, title)) if !artist.trim().is_empty() && !title.trim().is_empty() => Some(StreamTitle {
            artist: Some(artist.trim().to_string()),
            title: title.trim().to_string(),
        }),
        _ => Some(StreamTitle {
            artist: None,
            title: value.to_string(),
        }),
    }
}

async fn pump_reader<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, PipelineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; FILE_READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| PipelineError::Stream(e.to_string()))?;
        if n == 0 {
            return Ok(total);
        }
        write_all(writer, &buf[..n]).await?;
        total += n as u64;
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), PipelineError> {
    writer
        .write_all(data)
        .await
        .map_err(|e| PipelineError::Stream(format!("Decoder input closed: {}", e)))
}
