use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::audio::CaptureFormat;
use crate::config::EngineConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "webradio")]
#[command(about = "Play web radio with a ten-band equalizer and live recording")]
#[command(version)]
pub struct Args {
    /// Stream URL (or page URL with --resolve)
    pub source: Option<String>,

    /// Treat the source as a page URL and resolve it with yt-dlp
    #[arg(long)]
    pub resolve: bool,

    /// Display title for the source
    #[arg(long)]
    pub title: Option<String>,

    // Capture
    /// Recording format: mp3, flac, wav, ogg
    #[arg(long)]
    pub format: Option<CaptureFormat>,

    /// Directory for recordings
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Recording filename template ({station}, {title}, {artist}, {date}, {time})
    #[arg(long)]
    pub template: Option<String>,

    /// Start recording as soon as playback begins
    #[arg(long)]
    pub record: bool,

    // Sound
    /// Equalizer preset
    #[arg(long)]
    pub preset: Option<String>,

    /// Initial volume (0.0 - 1.0)
    #[arg(long)]
    pub volume: Option<f32>,

    /// Output device index (see --list-devices)
    #[arg(long)]
    pub device: Option<usize>,

    /// List audio output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    // Resilience
    /// Do not reconnect after stream faults
    #[arg(long)]
    pub no_reconnect: bool,

    /// Seconds without audio before the stream counts as stalled
    #[arg(long, value_parser = parse_secs)]
    pub stall_timeout: Option<Duration>,

    /// Reconnect attempts before giving up
    #[arg(long)]
    pub max_reconnects: Option<u32>,

    // Debug
    /// Config file (default: <config dir>/webradio/engine.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Layer command line overrides on top of the loaded config
    pub fn apply_to(&self, config: &mut EngineConfig) {
        if let Some(format) = self.format {
            config.capture_format = format;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(template) = &self.template {
            config.filename_template = template.clone();
        }
        if let Some(volume) = self.volume {
            config.initial_volume = volume;
        }
        if self.device.is_some() {
            config.output_device = self.device;
        }
        if self.no_reconnect {
            config.auto_reconnect = false;
        }
        if let Some(timeout) = self.stall_timeout {
            config.stall_timeout = timeout;
        }
        if let Some(max) = self.max_reconnects {
            config.max_reconnect_attempts = max;
        }
    }
}

/// Positive, representable number of seconds
fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: f64 = value.parse().map_err(|e| format!("{}", e))?;
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => Err(format!("{} is not a usable number of seconds", value)),
    }
}

/// A line typed on stdin
#[derive(Debug, Clone, PartialEq)]
pub enum LineCommand {
    Play,
    Pause,
    Stop,
    Seek(Duration),
    Volume(f32),
    EqualizerEnabled(bool),
    Preset(String),
    Band(usize, f32),
    /// Toggle recording
    Record,
    Status,
    Quit,
}

impl LineCommand {
    pub const HELP: &'static str =
        "commands: play | pause | stop | seek <secs> | vol <0-1> | eq <preset|on|off> | band <i> <db> | rec | status | quit";

    /// Parse one input line; `None` for blank or unrecognized input
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let command = words.next()?.to_ascii_lowercase();
        let arg = words.next();

        match (command.as_str(), arg) {
            ("play", _) => Some(Self::Play),
            ("pause", _) => Some(Self::Pause),
            ("stop", _) => Some(Self::Stop),
            ("seek", Some(secs)) => secs
                .parse::<f64>()
                .ok()
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .map(Self::Seek),
            ("vol" | "volume", Some(level)) => level.parse().ok().map(Self::Volume),
            ("eq", Some("on")) => Some(Self::EqualizerEnabled(true)),
            ("eq", Some("off")) => Some(Self::EqualizerEnabled(false)),
            ("eq", Some(preset)) => Some(Self::Preset(preset.to_string())),
            ("band", Some(index)) => {
                let index = index.parse().ok()?;
                let gain = words.next()?.parse().ok()?;
                Some(Self::Band(index, gain))
            }
            ("rec" | "record", _) => Some(Self::Record),
            ("status", _) => Some(Self::Status),
            ("quit" | "exit" | "q", _) => Some(Self::Quit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_commands() {
        assert_eq!(LineCommand::parse("play"), Some(LineCommand::Play));
        assert_eq!(LineCommand::parse("  PAUSE "), Some(LineCommand::Pause));
        assert_eq!(LineCommand::parse("seek 90.5"), Some(LineCommand::Seek(Duration::from_millis(90_500))));
        assert_eq!(LineCommand::parse("vol 0.3"), Some(LineCommand::Volume(0.3)));
        assert_eq!(LineCommand::parse("eq rock"), Some(LineCommand::Preset("rock".into())));
        assert_eq!(LineCommand::parse("eq off"), Some(LineCommand::EqualizerEnabled(false)));
        assert_eq!(LineCommand::parse("band 3 -4.5"), Some(LineCommand::Band(3, -4.5)));
        assert_eq!(LineCommand::parse("rec"), Some(LineCommand::Record));
        assert_eq!(LineCommand::parse("q"), Some(LineCommand::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(LineCommand::parse(""), None);
        assert_eq!(LineCommand::parse("seek"), None);
        assert_eq!(LineCommand::parse("seek -3"), None);
        assert_eq!(LineCommand::parse("seek 1e30"), None);
        assert_eq!(LineCommand::parse("seek inf"), None);
        assert_eq!(LineCommand::parse("band 3"), None);
        assert_eq!(LineCommand::parse("dance"), None);
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let args = Args::parse_from([
            "webradio",
            "http://radio.example/stream",
            "--format",
            "flac",
            "--no-reconnect",
            "--stall-timeout",
            "3",
            "--max-reconnects",
            "4",
            "--volume",
            "0.5",
        ]);
        let mut config = EngineConfig::default();
        args.apply_to(&mut config);

        assert_eq!(args.source.as_deref(), Some("http://radio.example/stream"));
        assert_eq!(config.capture_format, CaptureFormat::Flac);
        assert!(!config.auto_reconnect);
        assert_eq!(config.stall_timeout, Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 4);
        assert_eq!(config.initial_volume, 0.5);
        assert_eq!(config.output_device, None);
    }

    #[test]
    fn test_stall_timeout_rejects_unusable_values() {
        for bad in ["1e30", "0", "-2", "nan"] {
            let result = Args::try_parse_from(["webradio", "--stall-timeout", bad]);
            assert!(result.is_err(), "{} accepted", bad);
        }
        let args = Args::try_parse_from(["webradio", "--stall-timeout", "2.5"]).unwrap();
        assert_eq!(args.stall_timeout, Some(Duration::from_millis(2500)));
    }
}
