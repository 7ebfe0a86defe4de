//! Microphone audio capture.
//!
//! A [`MicrophoneBackend`] opens a platform input stream and hands raw mono
//! f32 blocks to a sink running on the audio thread. [`AudioCapture`] owns
//! that stream, turns blocks into fixed-size PCM frames at the session rate,
//! runs local VAD, and forwards [`CaptureEvent`]s over a bounded channel.

use crate::audio::pcm;
use crate::error::{CaptureFailure, Result, VoiceError, VoiceErrorCode, from_capture_failure};
use crate::pipeline::messages::AudioFrame;
use crate::vad::{VadTransition, VoiceActivityDetector};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Native-rate samples accumulated before a frame is produced.
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

/// Receives mono f32 blocks and the stream's native rate on the audio thread.
pub type SampleSink = Box<dyn FnMut(&[f32], u32) + Send + 'static>;

/// An open input stream. Dropping or closing it releases the device.
pub trait MicrophoneStream: Send {
    /// Native sample rate of the stream.
    fn sample_rate(&self) -> u32;
    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Source of microphone streams.
pub trait MicrophoneBackend: Send + Sync {
    /// Probe whether an input device can be used at all.
    ///
    /// # Errors
    ///
    /// Returns the platform reason the microphone is unusable.
    fn check_available(&self) -> std::result::Result<(), CaptureFailure>;

    /// Open and start a stream delivering samples to `sink`.
    ///
    /// # Errors
    ///
    /// Returns the platform reason the stream could not be opened.
    fn open(
        &self,
        device: Option<&str>,
        sink: SampleSink,
    ) -> std::result::Result<Box<dyn MicrophoneStream>, CaptureFailure>;

    /// Names of the input devices this backend can open.
    ///
    /// # Errors
    ///
    /// Returns the platform reason devices cannot be enumerated.
    fn list_devices(&self) -> std::result::Result<Vec<String>, CaptureFailure> {
        Ok(Vec::new())
    }
}

/// Events produced by an active capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// A PCM frame at the session sample rate.
    Frame(AudioFrame),
    /// The local speaking latch changed.
    VoiceActivity { speaking: bool },
    /// Running silence length since speech stopped.
    SilenceDetected { duration_ms: u64 },
}

/// Parameters for [`AudioCapture::start`].
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Rate frames are delivered at.
    pub target_sample_rate: u32,
    /// Local RMS threshold.
    pub vad_threshold: f32,
    /// Silence length that releases the speaking latch.
    pub silence_hangover: Duration,
    /// Input device name (None = default).
    pub device: Option<String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            vad_threshold: 0.01,
            silence_hangover: Duration::from_millis(1_500),
            device: None,
        }
    }
}

/// Converts native blocks into frames and VAD events. Runs on the audio thread.
pub struct FrameProcessor {
    target_rate: u32,
    block: Vec<f32>,
    vad: VoiceActivityDetector,
}

impl FrameProcessor {
    pub fn new(options: &CaptureOptions) -> Self {
        Self {
            target_rate: options.target_sample_rate,
            block: Vec::with_capacity(CAPTURE_BLOCK_SIZE),
            vad: VoiceActivityDetector::new(options.vad_threshold, options.silence_hangover),
        }
    }

    /// Drop buffered audio and VAD history.
    pub fn reset(&mut self) {
        self.block.clear();
        self.vad.reset();
    }

    /// Feed native-rate mono samples; returns events in emission order.
    pub fn process(&mut self, samples: &[f32], native_rate: u32, now: Instant) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (CAPTURE_BLOCK_SIZE - self.block.len()).min(rest.len());
            self.block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.block.len() == CAPTURE_BLOCK_SIZE {
                let block = std::mem::take(&mut self.block);
                self.block.reserve(CAPTURE_BLOCK_SIZE);
                self.emit_block(&block, native_rate, now, &mut events);
            }
        }
        events
    }

    fn emit_block(&mut self, block: &[f32], native_rate: u32, now: Instant, events: &mut Vec<CaptureEvent>) {
        let resampled = match pcm::downsample(block, native_rate, self.target_rate) {
            Ok(samples) => samples,
            Err(e) => {
                debug!("dropping capture block: {e}");
                return;
            }
        };

        let decision = self.vad.process(&resampled, now);
        match decision.transition {
            VadTransition::SpeechStarted => {
                events.push(CaptureEvent::VoiceActivity { speaking: true });
            }
            VadTransition::Silence { duration_ms } => {
                events.push(CaptureEvent::SilenceDetected { duration_ms });
            }
            VadTransition::SpeechEnded { silence_ms } => {
                events.push(CaptureEvent::SilenceDetected {
                    duration_ms: silence_ms,
                });
                events.push(CaptureEvent::VoiceActivity { speaking: false });
            }
            VadTransition::None => {}
        }

        events.push(CaptureEvent::Frame(AudioFrame {
            samples: pcm::float_to_pcm16(&resampled),
            sample_rate: self.target_rate,
            has_voice: decision.has_voice,
        }));
    }
}

/// Microphone capture owned by a voice session.
pub struct AudioCapture {
    backend: Arc<dyn MicrophoneBackend>,
    stream: Mutex<Option<Box<dyn MicrophoneStream>>>,
    paused: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
}

impl AudioCapture {
    pub fn new(backend: Arc<dyn MicrophoneBackend>) -> Self {
        Self {
            backend,
            stream: Mutex::new(None),
            paused: Arc::new(AtomicBool::new(false)),
            reset_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Input devices known to the backend.
    ///
    /// # Errors
    ///
    /// Returns a classified error if enumeration fails.
    pub fn list_devices(&self) -> Result<Vec<String>> {
        self.backend.list_devices().map_err(from_capture_failure)
    }

    /// Open the microphone and start emitting events on `tx`.
    ///
    /// A no-op when already started.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the microphone cannot be acquired or its
    /// native rate is below the target rate.
    pub fn start(&self, options: CaptureOptions, tx: mpsc::Sender<CaptureEvent>) -> Result<()> {
        let mut guard = self.lock_stream()?;
        if guard.is_some() {
            debug!("audio capture already started");
            return Ok(());
        }

        self.backend.check_available().map_err(from_capture_failure)?;

        self.paused.store(false, Ordering::SeqCst);
        self.reset_requested.store(false, Ordering::SeqCst);

        let mut processor = FrameProcessor::new(&options);
        let paused = Arc::clone(&self.paused);
        let reset_requested = Arc::clone(&self.reset_requested);
        let sink: SampleSink = Box::new(move |samples: &[f32], native_rate: u32| {
            if reset_requested.swap(false, Ordering::SeqCst) {
                processor.reset();
            }
            if paused.load(Ordering::SeqCst) {
                return;
            }
            for event in processor.process(samples, native_rate, Instant::now()) {
                // Never block the audio thread.
                if tx.try_send(event).is_err() {
                    debug!("capture channel full, dropping event");
                }
            }
        });

        let mut stream = self
            .backend
            .open(options.device.as_deref(), sink)
            .map_err(from_capture_failure)?;

        let native_rate = stream.sample_rate();
        if native_rate < options.target_sample_rate {
            stream.close();
            return Err(VoiceError::with_message(
                VoiceErrorCode::PlatformNotSupported,
                format!(
                    "microphone runs at {native_rate}Hz, below the required {}Hz",
                    options.target_sample_rate
                ),
            ));
        }

        info!(
            "audio capture started: native {}Hz -> target {}Hz",
            native_rate, options.target_sample_rate
        );
        *guard = Some(stream);
        Ok(())
    }

    /// Release the microphone. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        let stream = match self.stream.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut stream) = stream {
            stream.close();
            info!("audio capture stopped");
        }
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Keep the device open but stop emitting events.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume emission with fresh VAD state.
    pub fn resume(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Clear VAD history, e.g. after a barge-in.
    pub fn reset_speaking_state(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// A stream is open.
    pub fn is_open(&self) -> bool {
        self.stream.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// A stream is open and emitting.
    pub fn is_capturing(&self) -> bool {
        self.is_open() && !self.paused.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn lock_stream(&self) -> Result<std::sync::MutexGuard<'_, Option<Box<dyn MicrophoneStream>>>> {
        self.stream
            .lock()
            .map_err(|e| VoiceError::with_message(VoiceErrorCode::Unknown, format!("capture lock poisoned: {e}")))
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// cpal-backed microphone.
///
/// cpal streams are `!Send`, so each stream lives on its own thread which
/// reports the open result and then parks until asked to stop.
pub struct CpalMicrophone;

impl MicrophoneBackend for CpalMicrophone {
    fn list_devices(&self) -> std::result::Result<Vec<String>, CaptureFailure> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CaptureFailure::Unsupported(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }

    fn check_available(&self) -> std::result::Result<(), CaptureFailure> {
        let host = cpal::default_host();
        host.default_input_device()
            .map(|_| ())
            .ok_or_else(|| CaptureFailure::DeviceNotFound("no default input device".into()))
    }

    fn open(
        &self,
        device: Option<&str>,
        sink: SampleSink,
    ) -> std::result::Result<Box<dyn MicrophoneStream>, CaptureFailure> {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<u32, CaptureFailure>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let device_name = device.map(str::to_owned);

        let thread = std::thread::Builder::new()
            .name("voxline-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), sink) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(failure) => {
                        let _ = ready_tx.send(Err(failure));
                        return;
                    }
                };
                // Park until stop is requested or the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureFailure::Other(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(sample_rate)) => Ok(Box::new(CpalStreamHandle {
                sample_rate,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(failure)) => {
                let _ = thread.join();
                Err(failure)
            }
            Err(_) => {
                let _ = thread.join();
                Err(CaptureFailure::Other("capture thread exited before reporting".into()))
            }
        }
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    mut sink: SampleSink,
) -> std::result::Result<(cpal::Stream, u32), CaptureFailure> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| CaptureFailure::Unsupported(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| CaptureFailure::DeviceNotFound(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| CaptureFailure::DeviceNotFound("no default input device".into()))?
    };

    let device_label = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using input device: {device_label}");

    let default_config = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureFailure::DeviceNotFound(e.to_string())
        }
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            CaptureFailure::Unsupported(e.to_string())
        }
        other => classify_backend_message(other.to_string()),
    })?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    info!("native input config: {}Hz, {} channels", native_rate, native_channels);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if native_channels > 1 {
                    sink(&pcm::to_mono(data, native_channels), native_rate);
                } else {
                    sink(data, native_rate);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureFailure::DeviceNotFound(e.to_string())
            }
            cpal::BuildStreamError::StreamConfigNotSupported
            | cpal::BuildStreamError::InvalidArgument => CaptureFailure::Unsupported(e.to_string()),
            other => classify_backend_message(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| classify_backend_message(format!("failed to start input stream: {e}")))?;

    Ok((stream, native_rate))
}

/// Best-effort mapping of backend-specific error text.
fn classify_backend_message(message: String) -> CaptureFailure {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureFailure::PermissionDenied(message)
    } else if lower.contains("not available") || lower.contains("no such device") {
        CaptureFailure::DeviceNotFound(message)
    } else {
        CaptureFailure::Other(message)
    }
}

struct CpalStreamHandle {
    sample_rate: u32,
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneStream for CpalStreamHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("capture thread panicked");
        }
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
