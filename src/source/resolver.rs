use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ResolveError;

use super::types::{SourceDescriptor, SourceMetadata};

/// Upper bound for one resolver invocation
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for the availability check
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns a page reference into a playable, time-limited descriptor
pub trait Resolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        page_url: &'a str,
        metadata: &'a SourceMetadata,
    ) -> BoxFuture<'a, Result<SourceDescriptor, ResolveError>>;
}

/// Subset of `yt-dlp --dump-json` output we use
#[derive(Debug, Deserialize)]
struct VideoInfo {
    url: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    is_live: Option<bool>,
    webpage_url: Option<String>,
}

/// Resolver backed by the `yt-dlp` command line tool
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    program: String,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    fn args(page_url: &str) -> [&str; 7] {
        [
            "--dump-json",
            "--format",
            "bestaudio/best",
            "--no-playlist",
            "--no-warnings",
            "--",
            page_url,
        ]
    }

    /// Check whether the tool can be run at all
    pub async fn is_available(&self) -> bool {
        let version = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        matches!(timeout(VERSION_TIMEOUT, version).await, Ok(Ok(status)) if status.success())
    }

    #[instrument(skip(self, metadata))]
    async fn run(&self, page_url: &str, metadata: &SourceMetadata) -> Result<SourceDescriptor, ResolveError> {
        let output = Command::new(&self.program)
            .args(Self::args(page_url))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match timeout(RESOLVE_TIMEOUT, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResolveError::ToolNotFound(self.program.clone()));
            }
            Ok(Err(e)) => return Err(ResolveError::Failed(e.to_string())),
            Err(_) => {
                warn!(page_url, "Resolver timed out");
                return Err(ResolveError::Timeout(RESOLVE_TIMEOUT.as_secs()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            return Err(ResolveError::Failed(format!("{} ({})", message.trim(), output.status)));
        }

        let info: VideoInfo = serde_json::from_slice(&output.stdout)?;
        let descriptor = descriptor_from_info(info, page_url, metadata)?;
        debug!(title = ?descriptor.metadata.title, duration = ?descriptor.duration, "Resolved source");
        Ok(descriptor)
    }
}

impl Resolver for YtDlpResolver {
    fn resolve<'a>(
        &'a self,
        page_url: &'a str,
        metadata: &'a SourceMetadata,
    ) -> BoxFuture<'a, Result<SourceDescriptor, ResolveError>> {
        Box::pin(self.run(page_url, metadata))
    }
}

/// Build the descriptor; caller-supplied metadata wins over resolver output
fn descriptor_from_info(
    info: VideoInfo,
    page_url: &str,
    metadata: &SourceMetadata,
) -> Result<SourceDescriptor, ResolveError> {
    let locator = info
        .url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ResolveError::Failed("no playable audio format".into()))?;

    let live = info.is_live.unwrap_or(false);
    let duration = match info.duration.filter(|d| !live && *d > 0.0) {
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .map_err(|_| ResolveError::Failed(format!("invalid duration {}", secs)))?,
        ),
        None => None,
    };

    Ok(SourceDescriptor {
        locator,
        time_limited: true,
        metadata: SourceMetadata {
            title: metadata.title.clone().or(info.title),
            origin: metadata.origin.clone().or(info.uploader).or(info.channel),
            artwork: metadata.artwork.clone().or(info.thumbnail),
        },
        stable_reference: Some(info.webpage_url.unwrap_or_else(|| page_url.to_string())),
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://www.youtube.com/watch?v=abc123";

    fn info(json: &str) -> VideoInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_descriptor_is_time_limited_with_stable_reference() {
        let info = info(
            r#"{"url":"https://cdn.example/audio?expire=1","title":"Set","uploader":"DJ","duration":3600.5,
                "thumbnail":"https://i.example/t.jpg","webpage_url":"https://www.youtube.com/watch?v=abc123"}"#,
        );
        let d = descriptor_from_info(info, PAGE, &SourceMetadata::default()).unwrap();
        assert!(d.time_limited);
        assert_eq!(d.locator, "https://cdn.example/audio?expire=1");
        assert_eq!(d.stable_reference.as_deref(), Some(PAGE));
        assert_eq!(d.metadata.origin.as_deref(), Some("DJ"));
        assert_eq!(d.duration, Some(Duration::from_secs_f64(3600.5)));
    }

    #[test]
    fn test_live_video_has_no_duration() {
        let info = info(r#"{"url":"https://cdn.example/live","is_live":true,"duration":12.0}"#);
        let d = descriptor_from_info(info, PAGE, &SourceMetadata::default()).unwrap();
        assert!(d.is_live());
        assert_eq!(d.stable_reference.as_deref(), Some(PAGE));
    }

    #[test]
    fn test_caller_metadata_wins() {
        let info = info(r#"{"url":"u","title":"Resolver title"}"#);
        let metadata = SourceMetadata {
            title: Some("Catalog title".into()),
            ..Default::default()
        };
        let d = descriptor_from_info(info, PAGE, &metadata).unwrap();
        assert_eq!(d.metadata.title.as_deref(), Some("Catalog title"));
    }

    #[test]
    fn test_out_of_range_duration_fails() {
        let info = info(r#"{"url":"https://cdn.example/a","duration":1e30}"#);
        let err = descriptor_from_info(info, PAGE, &SourceMetadata::default()).unwrap_err();
        assert!(matches!(err, ResolveError::Failed(ref m) if m.contains("duration")));
    }

    #[test]
    fn test_missing_url_fails() {
        let info = info(r#"{"title":"No formats"}"#);
        assert!(matches!(
            descriptor_from_info(info, PAGE, &SourceMetadata::default()),
            Err(ResolveError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let resolver = YtDlpResolver::new("/nonexistent/yt-dlp");
        assert!(!resolver.is_available().await);
        let err = resolver.resolve(PAGE, &SourceMetadata::default()).await.unwrap_err();
        assert!(matches!(err, ResolveError::ToolNotFound(_)));
    }
}
