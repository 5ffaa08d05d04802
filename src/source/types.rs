use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Display metadata supplied by the catalog or resolver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub title: Option<String>,
    /// Station or channel name
    pub origin: Option<String>,
    /// Artwork URL
    pub artwork: Option<String>,
}

/// Everything needed to open a source. Immutable once a load begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Stream URL or local path handed to the decoder
    pub locator: String,
    /// The locator expires (resolver output); capture must use `stable_reference`
    pub time_limited: bool,
    #[serde(default)]
    pub metadata: SourceMetadata,
    /// Canonical page URL that can be re-resolved at any time
    pub stable_reference: Option<String>,
    /// Known length; `None` for live streams
    #[serde(default, with = "duration_secs")]
    pub duration: Option<Duration>,
}

impl SourceDescriptor {
    /// A live radio stream
    pub fn live(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            time_limited: false,
            metadata: SourceMetadata::default(),
            stable_reference: None,
            duration: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.metadata.title = Some(title.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.metadata.origin = Some(origin.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn is_live(&self) -> bool {
        self.duration.is_none()
    }

    /// Name used for recordings and log lines
    pub fn display_name(&self) -> &str {
        self.metadata
            .origin
            .as_deref()
            .or(self.metadata.title.as_deref())
            .unwrap_or(&self.locator)
    }
}

/// What a collaborator asks the session to play
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRequest {
    /// Ready-to-play descriptor (radio catalog entries)
    Direct(SourceDescriptor),
    /// A page that must go through the external resolver first
    Resolve { page_url: String, metadata: SourceMetadata },
}

impl SourceRequest {
    pub fn describe(&self) -> &str {
        match self {
            Self::Direct(descriptor) => &descriptor.locator,
            Self::Resolve { page_url, .. } => page_url,
        }
    }
}

impl From<SourceDescriptor> for SourceRequest {
    fn from(descriptor: SourceDescriptor) -> Self {
        Self::Direct(descriptor)
    }
}

/// Total length of the current media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDuration {
    Live,
    Finite(Duration),
}

impl From<Option<Duration>> for MediaDuration {
    fn from(duration: Option<Duration>) -> Self {
        match duration {
            Some(d) => Self::Finite(d),
            None => Self::Live,
        }
    }
}

impl std::fmt::Display for MediaDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Finite(d) => {
                let secs = d.as_secs();
                write!(f, "{}:{:02}", secs / 60, secs % 60)
            }
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs.filter(|s| *s > 0.0) {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("duration out of range: {}", secs))),
            None => Ok(None),
        }
    }
}
