use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::audio::CaptureFormat;

/// Longest sanitized name component, in characters
const MAX_NAME_CHARS: usize = 100;

/// Name used when nothing usable is left after sanitizing
const FALLBACK_NAME: &str = "recording";

/// Values substituted into a filename template
#[derive(Debug, Clone)]
pub struct NameFields<'a> {
    pub station: &'a str,
    pub title: Option<&'a str>,
    pub artist: Option<&'a str>,
    pub now: DateTime<Local>,
}

/// Make a string safe for use as a file name
pub fn sanitize(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    let truncated: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let truncated = truncated.trim_end_matches(|c| c == '.' || c == ' ');

    if truncated.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        truncated.to_string()
    }
}

/// Expand `{station}`, `{title}`, `{artist}`, `{date}` and `{time}` and
/// append the format's extension
pub fn render(template: &str, fields: &NameFields<'_>, format: CaptureFormat) -> String {
    let stem = template
        .replace("{station}", &sanitize(fields.station))
        .replace("{title}", &fields.title.map(sanitize).unwrap_or_default())
        .replace("{artist}", &fields.artist.map(sanitize).unwrap_or_default())
        .replace("{date}", &fields.now.format("%Y-%m-%d").to_string())
        .replace("{time}", &fields.now.format("%H-%M-%S").to_string());

    // The template itself may carry separators
    format!("{}.{}", sanitize(&stem), format.extension())
}

/// `dir/file_name`, or `dir/stem_N.ext` with the first free N
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match file_name.rsplit_once('.') {
        Some((stem, extension)) => (stem, Some(extension)),
        None => (file_name, None),
    };

    (1u32..)
        .map(|n| match extension {
            Some(extension) => dir.join(format!("{}_{}.{}", stem, n, extension)),
            None => dir.join(format!("{}_{}", stem, n)),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fields(station: &str) -> NameFields<'_> {
        NameFields {
            station,
            title: Some("Song: Part 1/2"),
            artist: None,
            now: Local.with_ymd_and_hms(2024, 3, 9, 21, 5, 7).unwrap(),
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize("  ..hidden.. "), "hidden");
        assert_eq!(sanitize("line\nbreak"), "line_break");
        assert_eq!(sanitize("..."), "recording");
        assert_eq!(sanitize(""), "recording");
        assert_eq!(sanitize(&"x".repeat(300)).chars().count(), 100);
    }

    #[test]
    fn test_render_default_template() {
        let name = render("{station}_{date}_{time}", &fields("Radio <1>"), CaptureFormat::Flac);
        assert_eq!(name, "Radio _1__2024-03-09_21-05-07.flac");
    }

    #[test]
    fn test_render_title_and_missing_artist() {
        let name = render("{artist} - {title}", &fields("x"), CaptureFormat::Mp3);
        assert_eq!(name, "- Song_ Part 1_2.mp3");
    }

    #[test]
    fn test_unique_path_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.wav"), dir.path().join("a.wav"));

        std::fs::write(dir.path().join("a.wav"), b"").unwrap();
        assert_eq!(unique_path(dir.path(), "a.wav"), dir.path().join("a_1.wav"));

        std::fs::write(dir.path().join("a_1.wav"), b"").unwrap();
        assert_eq!(unique_path(dir.path(), "a.wav"), dir.path().join("a_2.wav"));
    }
}
