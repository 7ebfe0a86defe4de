//! Voice session orchestrator.
//!
//! [`VoiceSession`] is a cloneable handle over one conversation's voice
//! mode. It owns the state machine and wires the three leaf components:
//!
//! ```text
//! AudioCapture ──frames──▶ TranscriptionLink ──transcripts──▶ message sink
//!      │                                                          │
//!      └──voice (barge-in)──▶ SpeechPlayer ◀──reply text chunks───┘
//! ```
//!
//! Each component reports through its own channel; a pump task per channel
//! feeds events into short, synchronous handlers that run under the session
//! lock. The lock is never held across an `.await`.

use crate::audio::capture::{AudioCapture, CaptureEvent, CaptureOptions, CpalMicrophone, MicrophoneBackend};
use crate::audio::playback::{CpalOutput, SpeechOutput};
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError, VoiceErrorCode};
use crate::pipeline::messages::{AudioDevices, SessionSnapshot, VoiceEvent};
use crate::pipeline::segmenter::SentenceSegmenter;
use crate::pipeline::state::{SessionStateMachine, Transition, VoiceSessionState};
use crate::stt::{TranscriptEvent, TranscriptionConnector, TranscriptionLink, WebSocketConnector};
use crate::tts::synth::{HttpSynthesizer, SpeechSynthesizer};
use crate::tts::{PlayerEvent, PlayerUpdate, SpeakOptions, SpeechHandle, SpeechPlayer, SynthesisSettings};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel buffer sizes.
const CAPTURE_CHANNEL_SIZE: usize = 64;
const TRANSCRIPT_CHANNEL_SIZE: usize = 32;
const EVENT_CHANNEL_SIZE: usize = 256;

/// Leaf component implementations used by a session.
#[derive(Clone)]
pub struct VoiceComponents {
    pub microphone: Arc<dyn MicrophoneBackend>,
    pub connector: Arc<dyn TranscriptionConnector>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub output: Arc<dyn SpeechOutput>,
}

impl VoiceComponents {
    /// cpal audio, WebSocket transcription and HTTP synthesis.
    pub fn system(config: &VoiceConfig) -> Self {
        Self {
            microphone: Arc::new(CpalMicrophone),
            connector: Arc::new(WebSocketConnector),
            synthesizer: Arc::new(HttpSynthesizer::new(config.endpoints.tts_base_url.clone())),
            output: Arc::new(CpalOutput::new(&config.audio)),
        }
    }
}

/// Identity of a started session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

struct ActiveSession {
    info: SessionInfo,
    started: Instant,
}

type TaggedTranscript = (u64, TranscriptEvent);

/// Mutable session state. Guarded by a std mutex; never held across `.await`.
struct Core {
    machine: SessionStateMachine,
    session: Option<ActiveSession>,
    partial_transcript: String,
    last_error: Option<VoiceError>,
    segmenter: SentenceSegmenter,
    link: Option<Arc<dyn TranscriptionLink>>,
    /// Bumped for every connection attempt and on session end; events from
    /// older connections are ignored.
    generation: u64,
    transcripts: Option<mpsc::Sender<TaggedTranscript>>,
    listening_paused: bool,
    reconnecting: bool,
    cancel: CancellationToken,
}

struct Inner {
    config: VoiceConfig,
    connector: Arc<dyn TranscriptionConnector>,
    capture: AudioCapture,
    player: SpeechPlayer,
    core: Mutex<Core>,
    events: broadcast::Sender<VoiceEvent>,
    message_sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Set by [`VoiceSession::destroy`]; the session cannot be restarted.
    destroyed: AtomicBool,
}

/// Handle to a voice session. Cheap to clone.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl VoiceSession {
    /// Validate `config` and build a session with the system components.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an `unknown` error listing every configuration problem. No
    /// device or network is touched in that case.
    pub fn new(config: VoiceConfig) -> Result<Self> {
        config.validate()?;
        let components = VoiceComponents::system(&config);
        Self::with_components(config, components)
    }

    /// Validate `config` and build a session with the given components.
    ///
    /// # Errors
    ///
    /// Returns an `unknown` error listing every configuration problem.
    pub fn with_components(config: VoiceConfig, components: VoiceComponents) -> Result<Self> {
        config.validate()?;

        let (player_tx, player_rx) = mpsc::unbounded_channel();
        let player = SpeechPlayer::new(
            SynthesisSettings::from_config(&config),
            components.synthesizer,
            components.output,
            player_tx,
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let inner = Arc::new(Inner {
            connector: components.connector,
            capture: AudioCapture::new(components.microphone),
            player,
            core: Mutex::new(Core {
                machine: SessionStateMachine::new(),
                session: None,
                partial_transcript: String::new(),
                last_error: None,
                segmenter: SentenceSegmenter::new(),
                link: None,
                generation: 0,
                transcripts: None,
                listening_paused: false,
                reconnecting: false,
                cancel: CancellationToken::new(),
            }),
            events,
            message_sink: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            config,
        });

        tokio::spawn(player_pump(Arc::downgrade(&inner), player_rx));
        info!(voice_id = %inner.config.voice_id, "voice session created");
        Ok(Self { inner })
    }

    /// Deliver committed transcripts to `sink` (the conversational backend).
    pub fn with_message_sink(self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.set_message_sink(Some(sink));
        self
    }

    /// Replace or clear the committed-transcript sink.
    pub fn set_message_sink(&self, sink: Option<mpsc::UnboundedSender<String>>) {
        if let Ok(mut s) = self.inner.message_sink.lock() {
            *s = sink;
        }
    }

    /// Receive every [`VoiceEvent`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> VoiceSessionState {
        self.inner.core().machine.state()
    }

    /// Input and output devices visible to the session's audio backends.
    ///
    /// # Errors
    ///
    /// Returns a classified error if either backend cannot enumerate.
    pub fn audio_devices(&self) -> Result<AudioDevices> {
        Ok(AudioDevices {
            inputs: self.inner.capture.list_devices()?,
            outputs: self.inner.player.list_output_devices()?,
        })
    }

    /// Start capture and transcription. Only valid from `idle`.
    ///
    /// On failure every partially acquired resource is released, the
    /// session moves to `error` and an `error` event is emitted.
    ///
    /// # Errors
    ///
    /// Returns the classified failure (token, microphone or connection), or
    /// an `unknown` error after [`destroy`](Self::destroy).
    pub async fn start_session(&self) -> Result<SessionInfo> {
        let inner = &self.inner;
        let (cancel, transcripts_rx) = {
            let mut core = inner.core();
            inner.require_alive()?;
            if core.machine.state() != VoiceSessionState::Idle {
                return Err(VoiceError::with_message(
                    VoiceErrorCode::Unknown,
                    "Cannot start session: already in progress",
                ));
            }
            inner.set_state(&mut core, VoiceSessionState::Initializing);
            core.last_error = None;
            core.cancel = CancellationToken::new();
            let (tx, rx) = mpsc::channel(TRANSCRIPT_CHANNEL_SIZE);
            core.transcripts = Some(tx);
            (core.cancel.clone(), rx)
        };

        tokio::spawn(transcript_pump(Arc::downgrade(inner), transcripts_rx, cancel.clone()));

        match inner.bring_up(&cancel).await {
            Ok(()) => {}
            Err(err) => {
                inner.fail_start(err.clone()).await;
                return Err(err);
            }
        }

        let mut core = inner.core();
        if core.machine.state() != VoiceSessionState::Initializing || cancel.is_cancelled() {
            // Ended while starting; end_session already tore everything down.
            drop(core);
            inner.capture.stop();
            return Err(VoiceError::with_message(
                VoiceErrorCode::Unknown,
                "session ended while starting",
            ));
        }
        let info = SessionInfo {
            id: format!("voice_{}", uuid::Uuid::new_v4().simple()),
            started_at: Utc::now(),
        };
        core.session = Some(ActiveSession {
            info: info.clone(),
            started: Instant::now(),
        });
        inner.set_state(&mut core, VoiceSessionState::Listening);
        inner.emit(VoiceEvent::SessionStarted {
            id: info.id.clone(),
            started_at: info.started_at,
        });
        inner.emit(VoiceEvent::ListeningStarted);
        info!(session_id = %info.id, "voice session started");
        Ok(info)
    }

    /// Tear everything down and return to `idle`. Safe from any state.
    pub async fn end_session(&self) {
        self.inner.end_session().await;
    }

    /// Stop emitting microphone audio (device stays open).
    pub fn pause_listening(&self) {
        let inner = &self.inner;
        let mut core = inner.core();
        if !core.machine.state().is_active() || core.listening_paused {
            return;
        }
        inner.capture.pause();
        core.listening_paused = true;
        inner.emit(VoiceEvent::ListeningStopped);
    }

    /// Resume microphone audio with fresh VAD state.
    pub fn resume_listening(&self) {
        let inner = &self.inner;
        let mut core = inner.core();
        if !core.machine.state().is_active() || !core.listening_paused {
            return;
        }
        inner.capture.resume();
        core.listening_paused = false;
        inner.emit(VoiceEvent::ListeningStarted);
    }

    /// Mute is pause/resume under another name.
    pub fn set_muted(&self, muted: bool) {
        if muted {
            self.pause_listening();
        } else {
            self.resume_listening();
        }
    }

    /// Speak `text` as a single utterance.
    ///
    /// # Errors
    ///
    /// Fails when no session is active.
    pub fn speak(&self, text: &str) -> Result<SpeechHandle> {
        let inner = &self.inner;
        let mut core = inner.core();
        inner.require_active(&core)?;
        Ok(inner.enqueue(&mut core, text))
    }

    /// Feed a chunk of streamed reply text.
    ///
    /// Complete sentences are queued for speech immediately; with
    /// `complete = true` the remaining fragment is queued too.
    ///
    /// # Errors
    ///
    /// Fails when no session is active.
    pub fn process_text_chunk(&self, chunk: &str, complete: bool) -> Result<Vec<SpeechHandle>> {
        let inner = &self.inner;
        let mut core = inner.core();
        inner.require_active(&core)?;
        let sentences = core.segmenter.push(chunk, complete);
        Ok(sentences
            .iter()
            .map(|sentence| inner.enqueue(&mut core, sentence))
            .collect())
    }

    /// Stop playback and drop pending reply text, without a barge-in event.
    pub fn stop_speaking(&self) {
        let inner = &self.inner;
        let mut core = inner.core();
        inner.player.stop();
        core.segmenter.clear();
        if core.machine.state() == VoiceSessionState::Speaking {
            inner.set_state(&mut core, VoiceSessionState::Listening);
        }
    }

    /// Point-in-time view, or `None` without a started session.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let inner = &self.inner;
        let core = inner.core();
        let session = core.session.as_ref()?;
        Some(SessionSnapshot {
            id: session.info.id.clone(),
            state: core.machine.state(),
            started_at: session.info.started_at,
            partial_transcript: core.partial_transcript.clone(),
            is_playing: inner.player.is_playing(),
            listening_paused: core.listening_paused,
            last_error: core.last_error.clone(),
        })
    }

    /// End the session and release the audio output for good.
    ///
    /// Later `start_session`, `speak` and `process_text_chunk` calls fail.
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.end_session().await;
        self.inner.player.destroy().await;
        self.inner.capture.stop();
        info!("voice session destroyed");
    }
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: VoiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, core: &mut Core, to: VoiceSessionState) -> bool {
        match core.machine.transition(to) {
            Transition::Changed { previous } => {
                self.emit(VoiceEvent::StateChanged { state: to, previous });
                true
            }
            Transition::Unchanged | Transition::Rejected => false,
        }
    }

    fn require_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(VoiceError::with_message(
                VoiceErrorCode::Unknown,
                "voice session has been destroyed",
            ));
        }
        Ok(())
    }

    fn require_active(&self, core: &Core) -> Result<()> {
        self.require_alive()?;
        match core.machine.state() {
            VoiceSessionState::Listening | VoiceSessionState::Processing | VoiceSessionState::Speaking => Ok(()),
            other => Err(VoiceError::with_message(
                VoiceErrorCode::Unknown,
                format!("no active voice session (state: {other})"),
            )),
        }
    }

    /// Only a queued utterance moves the session to `speaking`.
    fn enqueue(&self, core: &mut Core, text: &str) -> SpeechHandle {
        let handle = self.player.speak(text, SpeakOptions::default());
        if handle.is_queued() {
            self.set_state(core, VoiceSessionState::Speaking);
        }
        handle
    }

    fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            target_sample_rate: self.config.sample_rate,
            vad_threshold: self.config.local_vad_threshold,
            silence_hangover: Duration::from_secs_f32(self.config.silence_threshold_secs),
            device: self.config.audio.input_device.clone(),
        }
    }

    async fn fetch_token(&self) -> Result<Option<String>> {
        match &self.config.token_provider {
            Some(provider) => provider.fetch_token().await.map(Some),
            None => Ok(None),
        }
    }

    /// Token, microphone, then transcription.
    async fn bring_up(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let token = self.fetch_token().await?;
        self.remember_token(token.clone());

        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);
        self.capture.start(self.capture_options(), capture_tx)?;
        tokio::spawn(capture_pump(Arc::downgrade(self), capture_rx, cancel.clone()));

        self.open_connection(token).await
    }

    /// Fresh token, then a new connection.
    async fn refresh_connection(self: &Arc<Self>) -> Result<()> {
        let token = self.fetch_token().await?;
        self.remember_token(token.clone());
        self.open_connection(token).await
    }

    /// Synthesis falls back to the session token without a dedicated key.
    fn remember_token(&self, token: Option<String>) {
        if self.config.api_key_provider.is_none() {
            self.player.set_fallback_key(token);
        }
    }

    async fn fail_start(&self, err: VoiceError) {
        error!(code = %err.code, "voice session failed to start: {}", err.message);
        self.capture.stop();
        let link = {
            let mut core = self.core();
            core.cancel.cancel();
            core.generation += 1;
            core.transcripts = None;
            core.last_error = Some(err.clone());
            self.set_state(&mut core, VoiceSessionState::Error);
            self.emit(VoiceEvent::Error { error: err });
            core.link.take()
        };
        if let Some(link) = link {
            link.disconnect().await;
        }
    }

    /// Open a transcription connection and make it current.
    async fn open_connection(self: &Arc<Self>, token: Option<String>) -> Result<()> {
        let (generation, transcripts, cancel) = {
            let mut core = self.core();
            let transcripts = core
                .transcripts
                .clone()
                .ok_or_else(|| VoiceError::with_message(VoiceErrorCode::Unknown, "session not running"))?;
            core.generation += 1;
            (core.generation, transcripts, core.cancel.clone())
        };

        let (conn_tx, conn_rx) = mpsc::channel(TRANSCRIPT_CHANNEL_SIZE);
        tokio::spawn(forward_transcripts(generation, conn_rx, transcripts, cancel));

        let link: Arc<dyn TranscriptionLink> = Arc::from(self.connector.connect(&self.config, token, conn_tx).await?);

        let stale = {
            let mut core = self.core();
            if core.generation == generation && core.machine.state().is_active() {
                core.link.replace(Arc::clone(&link))
            } else {
                Some(link)
            }
        };
        if let Some(old) = stale {
            old.disconnect().await;
        }
        debug!(generation, "transcription connection ready");
        Ok(())
    }

    async fn end_session(&self) {
        let link = {
            let mut core = self.core();
            let state = core.machine.state();
            if state == VoiceSessionState::Idle && core.session.is_none() {
                return;
            }

            core.cancel.cancel();
            core.generation += 1;
            core.transcripts = None;
            self.capture.stop();
            self.player.stop();
            self.player.set_fallback_key(None);

            let session = core.session.take();
            core.partial_transcript.clear();
            core.segmenter.clear();
            core.last_error = None;
            core.listening_paused = false;
            core.reconnecting = false;

            if !matches!(core.machine.transition(VoiceSessionState::Idle), Transition::Changed { .. })
                && let Some(previous) = core.machine.reset()
            {
                warn!(%previous, "forced voice session reset to idle");
            }
            if state != VoiceSessionState::Idle {
                self.emit(VoiceEvent::StateChanged {
                    state: VoiceSessionState::Idle,
                    previous: state,
                });
            }

            if let Some(session) = session {
                let duration_ms = session.started.elapsed().as_millis() as u64;
                info!(session_id = %session.info.id, duration_ms, "voice session ended");
                self.emit(VoiceEvent::SessionEnded {
                    id: session.info.id,
                    duration_ms,
                });
            }
            self.emit(VoiceEvent::ListeningStopped);
            core.link.take()
        };

        if let Some(link) = link {
            link.disconnect().await;
        }
    }

    // ── capture ─────────────────────────────────────────────────────────

    fn handle_capture_event(&self, event: CaptureEvent) {
        let mut core = self.core();
        match event {
            CaptureEvent::Frame(frame) => {
                if frame.has_voice
                    && self.config.enable_barge_in
                    && core.machine.state() == VoiceSessionState::Speaking
                {
                    self.barge_in(&mut core);
                }
                if matches!(
                    core.machine.state(),
                    VoiceSessionState::Listening | VoiceSessionState::Processing
                ) && let Some(link) = &core.link
                    && link.is_connected()
                {
                    link.send_audio(&frame, false);
                }
            }
            CaptureEvent::VoiceActivity { speaking: true } => {
                if core.machine.state() == VoiceSessionState::Listening {
                    self.set_state(&mut core, VoiceSessionState::Processing);
                }
            }
            CaptureEvent::VoiceActivity { speaking: false } => {
                debug!("local VAD released");
            }
            // The service's VAD commits; local silence is informational.
            CaptureEvent::SilenceDetected { duration_ms } => {
                debug!(duration_ms, "local silence");
            }
        }
    }

    /// Interrupt playback because the user started talking.
    fn barge_in(&self, core: &mut Core) {
        info!("barge-in: user speech interrupted playback");
        self.player.stop();
        core.segmenter.clear();
        self.capture.reset_speaking_state();
        self.emit(VoiceEvent::BargeIn);
        if self.set_state(core, VoiceSessionState::Listening) {
            self.emit(VoiceEvent::ListeningStarted);
        }
    }

    // ── transcription ───────────────────────────────────────────────────

    fn handle_transcript(self: &Arc<Self>, generation: u64, event: TranscriptEvent) {
        let mut core = self.core();
        if generation != core.generation {
            debug!(generation, current = core.generation, "ignoring stale transcription event");
            return;
        }
        match event {
            TranscriptEvent::SessionStarted { session_id, .. } => {
                debug!(%session_id, "transcription session announced");
            }
            TranscriptEvent::Partial { text } => {
                core.partial_transcript.clone_from(&text);
                self.emit(VoiceEvent::TranscriptPartial { text });
            }
            TranscriptEvent::Committed { text, .. } => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    if core.machine.state() == VoiceSessionState::Processing {
                        self.set_state(&mut core, VoiceSessionState::Listening);
                    }
                    return;
                }
                if self.config.enable_barge_in
                    && (self.player.is_playing() || core.machine.state() == VoiceSessionState::Speaking)
                {
                    self.barge_in(&mut core);
                }
                core.partial_transcript.clear();
                self.emit(VoiceEvent::TranscriptCommitted { text: text.clone() });
                if core.machine.state() == VoiceSessionState::Processing {
                    self.set_state(&mut core, VoiceSessionState::Listening);
                }
                if let Ok(sink) = self.message_sink.lock()
                    && let Some(sink) = sink.as_ref()
                    && sink.send(text).is_err()
                {
                    debug!("message sink closed, dropping transcript");
                }
            }
            // Link failures are followed by `Closed`, which reconnects.
            // Only an exhausted reconnect reaches the user.
            TranscriptEvent::Error(err)
                if err.recoverable
                    && matches!(
                        err.code,
                        VoiceErrorCode::NetworkError | VoiceErrorCode::TranscriptionConnectionFailed
                    ) =>
            {
                warn!(code = %err.code, "transcription link failed: {}", err.message);
            }
            TranscriptEvent::Error(err) => {
                warn!(code = %err.code, "transcription error: {}", err.message);
                core.last_error = Some(err.clone());
                let unrecoverable = !err.recoverable;
                self.emit(VoiceEvent::Error { error: err });
                if unrecoverable {
                    self.halt(&mut core);
                }
            }
            TranscriptEvent::Closed { code, reason } => {
                debug!(code, %reason, "transcription connection closed");
                core.link = None;
                if core.machine.state().is_active() && !core.reconnecting {
                    core.reconnecting = true;
                    let cancel = core.cancel.clone();
                    tokio::spawn(reconnect(Arc::clone(self), cancel));
                }
            }
        }
    }

    /// Unrecoverable failure: stop everything and park in `error`.
    fn halt(&self, core: &mut Core) {
        core.cancel.cancel();
        core.generation += 1;
        self.capture.stop();
        self.player.stop();
        core.segmenter.clear();
        self.set_state(core, VoiceSessionState::Error);
        if let Some(link) = core.link.take() {
            tokio::spawn(async move { link.disconnect().await });
        }
    }

    // ── playback ────────────────────────────────────────────────────────

    fn handle_player_update(&self, update: PlayerUpdate) {
        let mut core = self.core();
        if update.epoch != self.player.epoch() {
            debug!(epoch = update.epoch, "ignoring playback event from a stopped epoch");
            return;
        }
        match update.event {
            PlayerEvent::Started { text } => {
                if !core.machine.state().is_active() {
                    return;
                }
                self.set_state(&mut core, VoiceSessionState::Speaking);
                self.emit(VoiceEvent::SpeakingStarted { text });
            }
            PlayerEvent::Ended { .. } => {
                self.emit(VoiceEvent::SpeakingEnded);
            }
            PlayerEvent::Error { error, .. } => {
                core.last_error = Some(error.clone());
                self.emit(VoiceEvent::Error { error });
            }
            PlayerEvent::Drained => {
                if core.machine.state() != VoiceSessionState::Speaking
                    || self.player.is_playing()
                    || self.player.queued_len() > 0
                {
                    return;
                }
                self.set_state(&mut core, VoiceSessionState::Listening);
                if self.config.auto_listen {
                    self.emit(VoiceEvent::ListeningStarted);
                } else if !core.listening_paused {
                    self.capture.pause();
                    core.listening_paused = true;
                    self.emit(VoiceEvent::ListeningStopped);
                }
            }
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(max)
}

/// Replace a closed transcription connection with a fresh one.
async fn reconnect(inner: Arc<Inner>, cancel: CancellationToken) {
    let policy = &inner.config.connection;
    let base = Duration::from_millis(policy.reconnect_base_delay_ms);
    let max = Duration::from_millis(policy.reconnect_max_delay_ms);
    let mut last_error: Option<VoiceError> = None;

    for attempt in 0..policy.max_reconnect_attempts {
        if cancel.is_cancelled() {
            return;
        }
        match inner.refresh_connection().await {
            Ok(()) => {
                info!(attempt, "transcription reconnected");
                inner.core().reconnecting = false;
                return;
            }
            Err(err) => {
                warn!(attempt, code = %err.code, "transcription reconnect failed: {}", err.message);
                last_error = Some(err);
            }
        }

        if attempt + 1 < policy.max_reconnect_attempts {
            let delay = backoff_delay(base, max, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    let detail = last_error
        .map(|e| e.message)
        .unwrap_or_else(|| "transcription connection closed".to_owned());
    let err = VoiceError::with_message(
        VoiceErrorCode::TranscriptionConnectionFailed,
        format!("could not reconnect to transcription: {detail}"),
    );
    error!("{}", err.message);
    let mut core = inner.core();
    core.reconnecting = false;
    core.last_error = Some(err.clone());
    inner.emit(VoiceEvent::Error { error: err });
}

async fn capture_pump(inner: Weak<Inner>, mut rx: mpsc::Receiver<CaptureEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            e = rx.recv() => e,
            _ = cancel.cancelled() => break,
        };
        let Some(event) = event else { break };
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_capture_event(event);
    }
    debug!("capture pump stopped");
}

async fn transcript_pump(inner: Weak<Inner>, mut rx: mpsc::Receiver<TaggedTranscript>, cancel: CancellationToken) {
    loop {
        let item = tokio::select! {
            e = rx.recv() => e,
            _ = cancel.cancelled() => break,
        };
        let Some((generation, event)) = item else { break };
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_transcript(generation, event);
    }
    debug!("transcript pump stopped");
}

async fn forward_transcripts(
    generation: u64,
    mut rx: mpsc::Receiver<TranscriptEvent>,
    tx: mpsc::Sender<TaggedTranscript>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            e = rx.recv() => e,
            _ = cancel.cancelled() => break,
        };
        let Some(event) = event else { break };
        if tx.send((generation, event)).await.is_err() {
            break;
        }
    }
}

async fn player_pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<PlayerUpdate>) {
    while let Some(update) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_player_update(update);
    }
}
