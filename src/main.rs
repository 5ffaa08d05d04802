mod audio;
mod capture;
mod cli;
mod config;
mod error;
mod pipeline;
mod playback;
mod session;
mod source;
#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::audio::{EqualizerState, FfmpegDecoder, SourceOpener};
use crate::cli::{Args, LineCommand};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::Backends;
use crate::playback::{list_audio_devices, PlaybackEngine};
use crate::session::{PlaybackSession, PlaybackState, SessionEvent};
use crate::source::{SourceDescriptor, SourceMetadata, SourceRequest, YtDlpResolver};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose);

    if args.list_devices {
        for device in list_audio_devices() {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}: {}{}", device.index, device.name, marker);
        }
        return Ok(());
    }

    info!("webradio v{} starting", env!("CARGO_PKG_VERSION"));

    let file_config = EngineConfig::load(args.config.as_deref())?;
    let mut config = file_config.clone();
    args.apply_to(&mut config);
    let config = config.normalized();
    let config_path = args.config.clone();

    // Pipelines get their own runtime so a busy control side never starves audio
    let streaming = tokio::runtime::Builder::new_multi_thread()
        .thread_name("webradio-stream")
        .enable_all()
        .build()?;

    let result = run(&streaming, config, args)
        .await
        .map(|equalizer| save_equalizer(file_config, config_path.as_deref(), equalizer));
    streaming.shutdown_background();

    if let Err(e) = &result {
        error!("Application error: {}", e);
    }
    info!("webradio shutdown complete");
    result
}

/// Initialize tracing subscriber
fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

/// Write equalizer changes back to the config file they were loaded from
fn save_equalizer(mut file_config: EngineConfig, path: Option<&Path>, equalizer: EqualizerState) {
    if file_config.equalizer == equalizer {
        return;
    }
    let Some(path) = EngineConfig::resolve_path(path) else {
        return;
    };
    file_config.equalizer = equalizer;
    match file_config.save(&path) {
        Ok(()) => info!(path = ?path, "Saved equalizer settings"),
        Err(e) => warn!(error = %e, "Failed to save equalizer settings"),
    }
}

/// Run the session until quit; returns the final equalizer settings
async fn run(streaming: &Runtime, config: EngineConfig, args: Args) -> Result<EqualizerState> {
    info!(
        source = ?args.source,
        resolve = args.resolve,
        format = %config.capture_format,
        reconnect = config.auto_reconnect,
        "Starting session"
    );

    let engine = PlaybackEngine::with_device(config.output_device)?;
    let opener = SourceOpener::new(config.connect_timeout)?;
    let resolver = Arc::new(YtDlpResolver::new(config.ytdlp_path.clone()));
    if args.resolve && !resolver.is_available().await {
        warn!(program = %config.ytdlp_path, "yt-dlp not found, page URLs will fail to resolve");
    }

    let backends = Backends {
        decoder: Arc::new(FfmpegDecoder::new(config.ffmpeg_path.clone(), opener)),
        output: Arc::new(engine),
    };
    let session = Arc::new(PlaybackSession::spawn_on(streaming.handle(), &config, backends, resolver));

    if let Some(preset) = &args.preset {
        if let Err(e) = session.apply_equalizer_preset(preset) {
            warn!(error = %e, "Ignoring preset");
        }
    }

    tokio::spawn(report_events(session.clone()));

    if let Some(source) = &args.source {
        session.load(request_for(source, &args))?;
        if args.record {
            tokio::spawn(record_when_playing(session.clone()));
        }
    } else {
        println!("No source given; type a command or quit");
    }

    println!("{}", LineCommand::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                match LineCommand::parse(&line) {
                    Some(LineCommand::Quit) => break,
                    Some(command) => {
                        if let Err(e) = handle_line(&session, command).await {
                            println!("error: {}", e);
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => println!("{}", LineCommand::HELP),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down...");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(session.get_equalizer())
}

fn request_for(source: &str, args: &Args) -> SourceRequest {
    let metadata = SourceMetadata {
        title: args.title.clone(),
        ..Default::default()
    };
    if args.resolve {
        SourceRequest::Resolve {
            page_url: source.to_string(),
            metadata,
        }
    } else {
        let mut descriptor = SourceDescriptor::live(source);
        descriptor.metadata = metadata;
        SourceRequest::Direct(descriptor)
    }
}

async fn handle_line(session: &PlaybackSession, command: LineCommand) -> std::result::Result<(), EngineError> {
    match command {
        LineCommand::Play => session.play()?,
        LineCommand::Pause => session.pause()?,
        LineCommand::Stop => session.stop()?,
        LineCommand::Seek(position) => session.seek(position)?,
        LineCommand::Volume(level) => println!("volume {:.2}", session.set_volume(level)),
        LineCommand::EqualizerEnabled(enabled) => {
            session.set_equalizer_enabled(enabled);
            println!("equalizer {}", if enabled { "on" } else { "off" });
        }
        LineCommand::Preset(name) => {
            session.apply_equalizer_preset(&name)?;
            println!("equalizer {}", name);
        }
        LineCommand::Band(index, gain) => {
            let applied = session.set_equalizer_band(index, gain)?;
            println!("band {} {:+.1} dB", index, applied);
        }
        LineCommand::Record => {
            if session.is_capturing() {
                let report = session.stop_capture().await?;
                println!("saved {} ({:.0}s)", report.path.display(), report.elapsed.as_secs_f64());
            } else {
                let info = session.start_capture(None).await?;
                println!("recording to {} ({})", info.path.display(), info.mode);
            }
        }
        LineCommand::Status => print_status(session),
        LineCommand::Quit => {}
    }
    Ok(())
}

fn print_status(session: &PlaybackSession) {
    let title = session
        .get_now_playing()
        .and_then(|np| np.display_title().map(str::to_string))
        .unwrap_or_else(|| "-".into());
    let duration = session
        .get_duration()
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".into());
    let equalizer = session.get_equalizer();

    println!("state    {}", session.state());
    println!("playing  {}", title);
    println!("position {:.0}s / {}", session.get_position().as_secs_f64(), duration);
    println!("volume   {:.2}", session.volume());
    let bypass = if equalizer.is_enabled() { "" } else { " (off)" };
    println!("eq       {}{} {:?}", equalizer.preset(), bypass, equalizer.gains());
    println!("record   {}", if session.is_capturing() { "on" } else { "off" });
}

async fn record_when_playing(session: Arc<PlaybackSession>) {
    let mut state = session.watch_state();
    let playing = state
        .wait_for(|s| matches!(s, PlaybackState::Playing | PlaybackState::Failed { .. }))
        .await
        .map(|s| *s == PlaybackState::Playing)
        .unwrap_or(false);
    if !playing {
        return;
    }
    match session.start_capture(None).await {
        Ok(info) => println!("recording to {}", info.path.display()),
        Err(e) => warn!(error = %e, "Could not start recording"),
    }
}

async fn report_events(session: Arc<PlaybackSession>) {
    let mut events = session.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event reporter lagging");
                continue;
            }
            Err(_) => break,
        };
        match event {
            SessionEvent::TrackChanged(now) => {
                let title = now.display_title().unwrap_or("unknown");
                let track = match &now.artist {
                    Some(artist) => format!("{} - {}", artist, title),
                    None => title.to_string(),
                };
                match &now.genre {
                    Some(genre) => println!("now playing: {} [{}]", track, genre),
                    None => println!("now playing: {}", track),
                }
            }
            SessionEvent::StateChanged(state) => println!("[{}]", state),
            SessionEvent::Buffering(percent) => debug!(percent, "Buffering"),
            SessionEvent::CaptureStarted { path, mode, format } => {
                info!(path = ?path, %mode, %format, "Recording started")
            }
            SessionEvent::CaptureStopped(report) if !report.finalized => {
                println!("partial recording kept at {}", report.path.display())
            }
            SessionEvent::CaptureStopped(report) => println!("recording saved to {}", report.path.display()),
            SessionEvent::CaptureFailed(message) => println!("recording failed: {}", message),
            SessionEvent::ReconnectAttempt { attempt, max, delay } => {
                println!("reconnecting in {:.1}s ({}/{})", delay.as_secs_f64(), attempt, max)
            }
            SessionEvent::Fatal(message) => println!("giving up: {}", message),
        }
    }
}
