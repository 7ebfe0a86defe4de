//! Audio playback to system speakers via cpal.

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError, VoiceErrorCode};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Decoded mono audio ready for output.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }
}

/// Sink for synthesized speech.
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Play `audio` to completion, or until `cancel` fires.
    ///
    /// Cancellation is not an error: implementations silence output and
    /// return `Ok(())` promptly.
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> Result<()>;

    /// Release the output device. Later `play` calls fail.
    fn close(&self);

    /// Names of the output devices this sink can use.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    fn list_devices(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Speaker output via cpal.
///
/// Each utterance opens a short-lived stream on a blocking thread (cpal
/// streams are `!Send`) and polls until the buffer drains.
pub struct CpalOutput {
    device_name: Option<String>,
    closed: Arc<AtomicBool>,
}

impl CpalOutput {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl SpeechOutput for CpalOutput {
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(output_error("audio output closed"));
        }
        if audio.samples.is_empty() || cancel.is_cancelled() {
            return Ok(());
        }
        let device_name = self.device_name.clone();
        tokio::task::spawn_blocking(move || play_blocking(device_name.as_deref(), &audio, &cancel))
            .await
            .map_err(|e| output_error(&format!("playback task failed: {e}")))?
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn list_devices(&self) -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.output_devices().map_err(|e| {
            VoiceError::with_message(VoiceErrorCode::PlatformNotSupported, format!("cannot enumerate devices: {e}"))
        })?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
}

fn output_error(detail: &str) -> VoiceError {
    VoiceError::with_message(VoiceErrorCode::SynthesisFailed, format!("audio output failed: {detail}"))
}

fn play_blocking(device_name: Option<&str>, audio: &DecodedAudio, cancel: &CancellationToken) -> Result<()> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| output_error(&format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| output_error(&format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| output_error("no default output device"))?
    };

    let default_config = device
        .default_output_config()
        .map_err(|e| output_error(&format!("no default output config: {e}")))?;
    let device_rate = default_config.sample_rate();
    let channels = default_config.channels().max(1);
    let stream_config = StreamConfig {
        channels,
        sample_rate: device_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let samples = if device_rate == audio.sample_rate {
        audio.samples.clone()
    } else {
        debug!("resampling playback {}Hz -> {}Hz", audio.sample_rate, device_rate);
        resample_linear(&audio.samples, audio.sample_rate, device_rate)
    };

    let buffer = Arc::new(Mutex::new(PlaybackBuffer {
        samples,
        position: 0,
        finished: false,
    }));
    let buffer_clone = Arc::clone(&buffer);
    let cancel_cb = cancel.clone();
    let ch = channels as usize;

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let mut buf = match buffer_clone.lock() {
                    Ok(b) => b,
                    Err(_) => return,
                };
                if cancel_cb.is_cancelled() {
                    data.fill(0.0);
                    buf.finished = true;
                    return;
                }
                for frame in data.chunks_mut(ch) {
                    let sample = if buf.position < buf.samples.len() {
                        let s = buf.samples[buf.position];
                        buf.position += 1;
                        s
                    } else {
                        buf.finished = true;
                        0.0
                    };
                    frame.fill(sample);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| output_error(&format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| output_error(&format!("failed to start output stream: {e}")))?;

    info!("playing {}ms of speech", audio.duration_ms());

    // Wait for playback to finish or be cancelled.
    loop {
        std::thread::sleep(std::time::Duration::from_millis(10));
        if cancel.is_cancelled() {
            break;
        }
        let buf = buffer
            .lock()
            .map_err(|e| output_error(&format!("playback buffer lock poisoned: {e}")))?;
        if buf.finished {
            break;
        }
    }

    drop(stream);
    Ok(())
}

/// Linear-interpolation resampler for matching the device rate.
fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };

        output.push(sample as f32);
    }

    output
}
