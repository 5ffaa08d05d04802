use std::sync::mpsc;
use std::thread;

use rodio::buffer::SamplesBuffer;
use rodio::cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info, instrument, warn};

use crate::audio::{PcmChunk, CHANNELS, SAMPLE_RATE};
use crate::error::PipelineError;

use super::{AudioOutput, OutputSink};

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    pub index: usize,
    pub is_default: bool,
}

/// Get list of available audio output devices
pub fn list_audio_devices() -> Vec<AudioDevice> {
    let host = rodio::cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();

    match host.output_devices() {
        Ok(output_devices) => {
            for (index, device) in output_devices.enumerate() {
                let name = device.name().unwrap_or_else(|_| format!("Device {}", index));
                let is_default = default_name.as_deref() == Some(name.as_str());
                devices.push(AudioDevice { name, index, is_default });
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to enumerate audio devices");
        }
    }

    devices
}

/// Open an output stream on the selected device, falling back to the default
fn open_stream(device_index: Option<usize>) -> Result<(OutputStream, OutputStreamHandle), PipelineError> {
    let host = rodio::cpal::default_host();

    if let Some(index) = device_index {
        match host.output_devices().ok().and_then(|mut devices| devices.nth(index)) {
            Some(device) => {
                let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
                info!(device = %name, index, "Using selected audio device");
                match OutputStream::try_from_device(&device) {
                    Ok(pair) => return Ok(pair),
                    Err(e) => warn!(error = %e, "Failed to open selected device, using default"),
                }
            }
            None => warn!(index, "Device index out of range, using default"),
        }
    }

    OutputStream::try_default().map_err(|e| PipelineError::Device(format!("Failed to open audio device: {}", e)))
}

/// Owner of the output device for a playback session.
///
/// The rodio `OutputStream` is not `Send`, so it lives on a dedicated
/// thread for as long as the engine exists; pipelines get sinks on it
/// through the stream handle.
pub struct PlaybackEngine {
    handle: OutputStreamHandle,
    /// Dropping this releases the device thread
    _shutdown: mpsc::Sender<()>,
}

impl PlaybackEngine {
    /// Open the output device (default when `device_index` is `None`)
    #[instrument]
    pub fn with_device(device_index: Option<usize>) -> Result<Self, PipelineError> {
        info!("Initializing audio output");

        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("webradio-output".into())
            .spawn(move || {
                let stream = match open_stream(device_index) {
                    Ok((stream, handle)) => {
                        let _ = ready_tx.send(Ok(handle));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the engine is dropped
                let _ = shutdown_rx.recv();
                debug!("Releasing audio device");
                drop(stream);
            })
            .map_err(|e| PipelineError::Device(format!("Failed to spawn output thread: {}", e)))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| PipelineError::Device("Output thread exited".into()))??;

        debug!("Audio output initialized");
        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }
}

impl AudioOutput for PlaybackEngine {
    fn open_sink(&self) -> Result<Box<dyn OutputSink>, PipelineError> {
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| PipelineError::Device(format!("Failed to create audio sink: {}", e)))?;
        Ok(Box::new(RodioSink { sink }))
    }
}

/// Playback sink backed by a rodio queue
struct RodioSink {
    sink: Sink,
}

impl OutputSink for RodioSink {
    fn append(&self, chunk: &PcmChunk) {
        self.sink
            .append(SamplesBuffer::new(CHANNELS, SAMPLE_RATE, chunk.samples.to_vec()));
    }

    fn queued(&self) -> usize {
        self.sink.len()
    }

    fn set_volume(&self, volume: f32) {
        debug!(volume, "Setting volume");
        self.sink.set_volume(volume);
    }

    fn pause(&self) {
        debug!("Pausing playback");
        self.sink.pause();
    }

    fn resume(&self) {
        debug!("Resuming playback");
        self.sink.play();
    }

    fn stop(&self) {
        self.sink.stop();
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        debug!("Dropping playback sink");
        self.sink.stop();
    }
}
