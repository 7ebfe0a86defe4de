//! Streamed speech synthesis and FIFO playback.
//!
//! [`SpeechPlayer`] owns a single worker task. Utterances are queued by
//! [`SpeechPlayer::speak`] and processed strictly one at a time: synthesize,
//! decode, play. [`SpeechPlayer::stop`] cancels the in-flight utterance and
//! discards everything queued behind it.

pub mod decode;
pub mod synth;

use crate::audio::playback::SpeechOutput;
use crate::config::{AudioFormat, TokenProvider, TtsModel, VoiceConfig};
use crate::error::{Result, VoiceError, VoiceErrorCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use synth::{SpeechSynthesizer, SynthesisRequest};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-utterance overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakOptions {
    pub voice_id: Option<String>,
    pub model: Option<TtsModel>,
}

/// How an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Played to the end.
    Completed,
    /// Stopped or discarded before finishing.
    Cancelled,
}

/// Resolves once the utterance finishes, fails or is cancelled.
#[derive(Debug)]
pub struct SpeechHandle {
    rx: Option<oneshot::Receiver<Result<SpeechOutcome>>>,
    queued: bool,
}

impl SpeechHandle {
    fn ready(outcome: SpeechOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(outcome));
        Self { rx: Some(rx), queued: false }
    }

    /// The utterance reached the worker's queue; lifecycle events will follow.
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    /// Wait for the utterance outcome.
    ///
    /// # Errors
    ///
    /// Returns the classified synthesis or playback failure.
    pub async fn wait(mut self) -> Result<SpeechOutcome> {
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Ok(SpeechOutcome::Cancelled)),
            None => Ok(SpeechOutcome::Cancelled),
        }
    }
}

/// Player lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Synthesis for `text` began.
    Started { text: String },
    /// `text` played to completion.
    Ended { text: String },
    /// `text` failed; the queue continues.
    Error { text: String, error: VoiceError },
    /// The queue emptied after at least one utterance ran to an end.
    Drained,
}

/// A [`PlayerEvent`] tagged with the stop epoch it belongs to.
///
/// The epoch advances on every [`SpeechPlayer::stop`], so consumers can
/// drop notifications that were already in flight when playback was stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerUpdate {
    pub epoch: u64,
    pub event: PlayerEvent,
}

/// Fixed synthesis parameters for a session.
#[derive(Clone)]
pub struct SynthesisSettings {
    pub voice_id: String,
    pub model: TtsModel,
    pub output_format: AudioFormat,
    pub latency_optimization: u8,
    pub language_code: String,
    /// Dedicated key supplier; falls back to [`SpeechPlayer::set_fallback_key`].
    pub api_key_provider: Option<Arc<dyn TokenProvider>>,
}

impl SynthesisSettings {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            voice_id: config.voice_id.clone(),
            model: config.tts_model,
            output_format: config.audio_format,
            latency_optimization: config.latency_optimization,
            language_code: config.language_code.clone(),
            api_key_provider: config.api_key_provider.clone(),
        }
    }
}

struct Utterance {
    text: String,
    options: SpeakOptions,
    done: oneshot::Sender<Result<SpeechOutcome>>,
}

struct Shared {
    /// Lock order: `epoch` before `queue`.
    epoch: Mutex<CancellationToken>,
    epoch_id: AtomicU64,
    queue: Mutex<VecDeque<Utterance>>,
    notify: Notify,
    playing: AtomicBool,
    fallback_key: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

/// FIFO speech queue with immediate cancellation.
pub struct SpeechPlayer {
    shared: Arc<Shared>,
    output: Arc<dyn SpeechOutput>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpeechPlayer {
    /// Create a player and spawn its worker on the current runtime.
    pub fn new(
        settings: SynthesisSettings,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        output: Arc<dyn SpeechOutput>,
        events: mpsc::UnboundedSender<PlayerUpdate>,
    ) -> Self {
        let shared = Arc::new(Shared {
            epoch: Mutex::new(CancellationToken::new()),
            epoch_id: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            playing: AtomicBool::new(false),
            fallback_key: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        let worker = Worker {
            shared: Arc::clone(&shared),
            settings,
            synthesizer,
            output: Arc::clone(&output),
            events,
        };
        let handle = tokio::spawn(worker.run());
        Self {
            shared,
            output,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Key used when no dedicated supplier is configured.
    pub fn set_fallback_key(&self, key: Option<String>) {
        if let Ok(mut k) = self.shared.fallback_key.lock() {
            *k = key;
        }
    }

    /// Queue `text` for synthesis and playback.
    ///
    /// Blank text resolves immediately as completed.
    pub fn speak(&self, text: &str, options: SpeakOptions) -> SpeechHandle {
        let text = text.trim();
        if text.is_empty() {
            return SpeechHandle::ready(SpeechOutcome::Completed);
        }
        if self.shared.shutdown.is_cancelled() {
            return SpeechHandle::ready(SpeechOutcome::Cancelled);
        }
        let (tx, rx) = oneshot::channel();
        match self.shared.queue.lock() {
            Ok(mut queue) => queue.push_back(Utterance {
                text: text.to_owned(),
                options,
                done: tx,
            }),
            Err(_) => return SpeechHandle::ready(SpeechOutcome::Cancelled),
        }
        self.shared.notify.notify_one();
        SpeechHandle { rx: Some(rx), queued: true }
    }

    /// Abort the current utterance and discard the queue.
    ///
    /// Output is told to go silent before this returns; discarded handles
    /// resolve as cancelled.
    pub fn stop(&self) {
        let discarded: Vec<Utterance> = {
            let Ok(mut epoch) = self.shared.epoch.lock() else {
                return;
            };
            epoch.cancel();
            *epoch = CancellationToken::new();
            self.shared.epoch_id.fetch_add(1, Ordering::SeqCst);
            self.shared.playing.store(false, Ordering::SeqCst);
            match self.shared.queue.lock() {
                Ok(mut queue) => queue.drain(..).collect(),
                Err(_) => Vec::new(),
            }
        };
        if !discarded.is_empty() {
            debug!(count = discarded.len(), "discarding queued utterances");
        }
        for utterance in discarded {
            let _ = utterance.done.send(Ok(SpeechOutcome::Cancelled));
        }
    }

    /// Stop, shut down the worker and release the output device.
    pub async fn destroy(&self) {
        self.stop();
        self.shared.shutdown.cancel();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!("speech worker ended abnormally: {e}");
        }
        self.output.close();
        info!("speech player destroyed");
    }

    /// Output devices available to the speaker sink.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_output_devices(&self) -> Result<Vec<String>> {
        self.output.list_devices()
    }

    /// Current stop epoch.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch_id.load(Ordering::SeqCst)
    }

    /// An utterance is being synthesized or played.
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    /// Utterances waiting behind the current one.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl Drop for SpeechPlayer {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Ok(epoch) = self.shared.epoch.lock() {
            epoch.cancel();
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    settings: SynthesisSettings,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn SpeechOutput>,
    events: mpsc::UnboundedSender<PlayerUpdate>,
}

impl Worker {
    fn emit(&self, epoch: u64, event: PlayerEvent) {
        let _ = self.events.send(PlayerUpdate { epoch, event });
    }

    async fn run(self) {
        let mut finished_any = false;
        loop {
            if self.shared.shutdown.is_cancelled() {
                break;
            }

            let next = {
                let Ok(epoch) = self.shared.epoch.lock() else {
                    break;
                };
                let utterance = self.shared.queue.lock().ok().and_then(|mut q| q.pop_front());
                let epoch_id = self.shared.epoch_id.load(Ordering::SeqCst);
                utterance.map(|u| (u, epoch.clone(), epoch_id))
            };

            let Some((utterance, cancel, epoch_id)) = next else {
                if finished_any {
                    finished_any = false;
                    self.emit(self.shared.epoch_id.load(Ordering::SeqCst), PlayerEvent::Drained);
                }
                tokio::select! {
                    _ = self.shared.notify.notified() => {}
                    _ = self.shared.shutdown.cancelled() => break,
                }
                continue;
            };

            self.shared.playing.store(true, Ordering::SeqCst);
            self.emit(
                epoch_id,
                PlayerEvent::Started {
                    text: utterance.text.clone(),
                },
            );

            let result = tokio::select! {
                r = self.play_one(&utterance, &cancel) => r,
                _ = cancel.cancelled() => Ok(SpeechOutcome::Cancelled),
            };
            self.shared.playing.store(false, Ordering::SeqCst);

            match &result {
                Ok(SpeechOutcome::Completed) => {
                    finished_any = true;
                    self.emit(
                        epoch_id,
                        PlayerEvent::Ended {
                            text: utterance.text.clone(),
                        },
                    );
                }
                Ok(SpeechOutcome::Cancelled) => {
                    debug!("utterance cancelled");
                }
                Err(error) => {
                    finished_any = true;
                    warn!(code = %error.code, "utterance failed: {}", error.message);
                    self.emit(
                        epoch_id,
                        PlayerEvent::Error {
                            text: utterance.text.clone(),
                            error: error.clone(),
                        },
                    );
                }
            }
            let _ = utterance.done.send(result);
        }
        debug!("speech worker stopped");
    }

    async fn play_one(&self, utterance: &Utterance, cancel: &CancellationToken) -> Result<SpeechOutcome> {
        let api_key = self.api_key().await?;
        let request = SynthesisRequest {
            text: utterance.text.clone(),
            voice_id: utterance
                .options
                .voice_id
                .clone()
                .unwrap_or_else(|| self.settings.voice_id.clone()),
            model: utterance.options.model.unwrap_or(self.settings.model),
            output_format: self.settings.output_format,
            latency_optimization: self.settings.latency_optimization,
            language_code: self.settings.language_code.clone(),
            api_key,
        };

        let bytes = self.synthesizer.synthesize(&request).await?;
        let format = self.settings.output_format;
        let audio = tokio::task::spawn_blocking(move || decode::decode(&bytes, format))
            .await
            .map_err(|e| {
                VoiceError::with_message(VoiceErrorCode::SynthesisFailed, format!("decode task failed: {e}"))
            })??;

        self.output.play(audio, cancel.clone()).await?;
        if cancel.is_cancelled() {
            Ok(SpeechOutcome::Cancelled)
        } else {
            Ok(SpeechOutcome::Completed)
        }
    }

    async fn api_key(&self) -> Result<String> {
        if let Some(provider) = &self.settings.api_key_provider {
            return provider.fetch_token().await;
        }
        self.shared
            .fallback_key
            .lock()
            .ok()
            .and_then(|k| k.clone())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                VoiceError::with_message(VoiceErrorCode::TokenExpired, "no synthesis API key available")
            })
    }
}
