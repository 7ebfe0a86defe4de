//! Configuration types for voice sessions.
//!
//! A [`VoiceConfig`] is loaded (TOML or code), validated once with
//! [`VoiceConfig::validate`], and then frozen inside the session for its
//! whole lifetime.

use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Sample rates the transcription endpoint accepts for PCM input.
pub const SUPPORTED_SAMPLE_RATES: &[u32] = &[8_000, 16_000, 22_050, 24_000, 44_100, 48_000];

/// Supplies short-lived credentials (transcription tokens, synthesis keys).
///
/// Issuing credentials is outside this crate; callers inject whatever
/// fetches them.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a fresh token. Called once per transcription connection.
    async fn fetch_token(&self) -> Result<String>;
}

/// A fixed credential, mostly useful for local testing.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn fetch_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Adapts an async closure into a [`TokenProvider`].
pub struct FnTokenProvider<F>(pub F);

#[async_trait]
impl<F, Fut> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn fetch_token(&self) -> Result<String> {
        (self.0)().await
    }
}

/// Synthesis model identifiers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtsModel {
    /// Low-latency model.
    #[default]
    #[serde(rename = "eleven_flash_v2_5")]
    FlashV2_5,
    /// Higher-quality multilingual model.
    #[serde(rename = "eleven_multilingual_v2")]
    MultilingualV2,
}

impl TtsModel {
    const ALL: &'static [Self] = &[Self::FlashV2_5, Self::MultilingualV2];

    /// Wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FlashV2_5 => "eleven_flash_v2_5",
            Self::MultilingualV2 => "eleven_multilingual_v2",
        }
    }
}

/// Transcription model identifiers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SttModel {
    /// Realtime streaming model with server-side VAD.
    #[default]
    #[serde(rename = "scribe_v2_realtime")]
    ScribeV2Realtime,
}

impl SttModel {
    const ALL: &'static [Self] = &[Self::ScribeV2Realtime];

    /// Wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScribeV2Realtime => "scribe_v2_realtime",
        }
    }
}

/// Synthesis output formats.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// MP3, 44.1 kHz, 128 kbps.
    #[default]
    #[serde(rename = "mp3_44100_128")]
    Mp3_44100_128,
    /// Raw signed 16-bit little-endian PCM, 24 kHz mono.
    #[serde(rename = "pcm_24000")]
    Pcm24000,
}

impl AudioFormat {
    const ALL: &'static [Self] = &[Self::Mp3_44100_128, Self::Pcm24000];

    /// Wire identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3_44100_128 => "mp3_44100_128",
            Self::Pcm24000 => "pcm_24000",
        }
    }
}

macro_rules! impl_wire_id {
    ($ty:ty, $what:literal) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| {
                        let valid: Vec<&str> = Self::ALL.iter().map(|v| v.as_str()).collect();
                        ConfigError {
                            problems: vec![format!(
                                "{} must be one of: {} (got '{s}')",
                                $what,
                                valid.join(", ")
                            )],
                        }
                    })
            }
        }
    };
}

impl_wire_id!(TtsModel, "tts_model");
impl_wire_id!(SttModel, "stt_model");
impl_wire_id!(AudioFormat, "audio_format");

/// Remote service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Realtime transcription WebSocket URL (query parameters are appended).
    pub stt_url: String,
    /// Base URL of the synthesis API.
    pub tts_base_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            stt_url: "wss://api.elevenlabs.io/v1/speech-to-text/realtime".to_owned(),
            tts_base_url: "https://api.elevenlabs.io".to_owned(),
        }
    }
}

/// Transcription connection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Hard timeout for the socket to announce readiness.
    pub connect_timeout_ms: u64,
    /// Reconnect attempts after a close before giving up (0 = never reconnect).
    pub max_reconnect_attempts: u32,
    /// First backoff delay between failed reconnects.
    pub reconnect_base_delay_ms: u64,
    /// Backoff ceiling.
    pub reconnect_max_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 5_000,
        }
    }
}

/// Local audio device selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

/// User-facing strings shown by the consuming UI.
///
/// Any subset may be overridden; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceTexts {
    pub title: String,
    pub listening: String,
    pub microphone_hint: String,
    pub speaking: String,
    pub processing: String,
    pub error_title: String,
}

impl Default for VoiceTexts {
    fn default() -> Self {
        Self {
            title: "Fully voice mode".to_owned(),
            listening: "I'm listening, how can I help you?".to_owned(),
            microphone_hint: "The microphone is on, you can speak whenever you're ready."
                .to_owned(),
            speaking: "Speaking...".to_owned(),
            processing: "Processing...".to_owned(),
            error_title: "Something went wrong".to_owned(),
        }
    }
}

/// Top-level configuration for a voice session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Synthesis voice identity (required).
    pub voice_id: String,
    /// ISO 639-1 language code for both directions.
    pub language_code: String,
    /// Synthesis model.
    pub tts_model: TtsModel,
    /// Transcription model.
    pub stt_model: SttModel,
    /// Synthesis output format.
    pub audio_format: AudioFormat,
    /// Capture/transcription sample rate in Hz.
    pub sample_rate: u32,
    /// Server-side silence (seconds) before an utterance is auto-committed.
    pub silence_threshold_secs: f32,
    /// Server-side VAD sensitivity (lower = more sensitive).
    pub vad_threshold: f32,
    /// Local RMS threshold for barge-in and UI voice activity.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive
    ///   - 0.01:  normal (default)
    ///   - 0.05:  only loud/close speech
    pub local_vad_threshold: f32,
    /// Minimum speech (ms) before the server commits, filters short noises.
    pub min_speech_duration_ms: u32,
    /// Audio (ms) retained before detected speech onset.
    pub prefix_padding_ms: u32,
    /// Synthesis streaming-latency optimization level (0-4).
    pub latency_optimization: u8,
    /// Allow the user to interrupt playback by speaking.
    pub enable_barge_in: bool,
    /// Keep the microphone live after the agent finishes speaking.
    pub auto_listen: bool,
    pub endpoints: EndpointConfig,
    pub connection: ConnectionConfig,
    pub audio: AudioConfig,
    pub texts: VoiceTexts,
    /// Transcription token supplier.
    #[serde(skip)]
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Synthesis API key supplier; falls back to the current transcription
    /// token when absent.
    #[serde(skip)]
    pub api_key_provider: Option<Arc<dyn TokenProvider>>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            language_code: "pt".to_owned(),
            tts_model: TtsModel::default(),
            stt_model: SttModel::default(),
            audio_format: AudioFormat::default(),
            sample_rate: 16_000,
            silence_threshold_secs: 1.5,
            vad_threshold: 0.4,
            local_vad_threshold: 0.01,
            min_speech_duration_ms: 100,
            prefix_padding_ms: 300,
            latency_optimization: 3,
            enable_barge_in: true,
            auto_listen: true,
            endpoints: EndpointConfig::default(),
            connection: ConnectionConfig::default(),
            audio: AudioConfig::default(),
            texts: VoiceTexts::default(),
            token_provider: None,
            api_key_provider: None,
        }
    }
}

impl std::fmt::Debug for VoiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConfig")
            .field("voice_id", &self.voice_id)
            .field("language_code", &self.language_code)
            .field("tts_model", &self.tts_model)
            .field("stt_model", &self.stt_model)
            .field("audio_format", &self.audio_format)
            .field("sample_rate", &self.sample_rate)
            .field("silence_threshold_secs", &self.silence_threshold_secs)
            .field("vad_threshold", &self.vad_threshold)
            .field("local_vad_threshold", &self.local_vad_threshold)
            .field("min_speech_duration_ms", &self.min_speech_duration_ms)
            .field("prefix_padding_ms", &self.prefix_padding_ms)
            .field("latency_optimization", &self.latency_optimization)
            .field("enable_barge_in", &self.enable_barge_in)
            .field("auto_listen", &self.auto_listen)
            .field("endpoints", &self.endpoints)
            .field("connection", &self.connection)
            .field("audio", &self.audio)
            .field("token_provider", &self.token_provider.as_ref().map(|_| "<provider>"))
            .field("api_key_provider", &self.api_key_provider.as_ref().map(|_| "<provider>"))
            .finish_non_exhaustive()
    }
}

impl VoiceConfig {
    /// Defaults with the given voice identity.
    pub fn new(voice_id: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            ..Self::default()
        }
    }

    /// Attach the transcription token supplier.
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Attach a dedicated synthesis key supplier.
    pub fn with_api_key_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.api_key_provider = Some(provider);
        self
    }

    /// Server-side silence window in whole milliseconds.
    pub fn silence_duration_ms(&self) -> u32 {
        (self.silence_threshold_secs * 1000.0).round() as u32
    }

    /// Check every rule and report all violations at once.
    ///
    /// Model and format identifiers are typed, so they are checked when the
    /// configuration is parsed rather than here.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] listing each violated rule.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.voice_id.trim().is_empty() {
            problems.push("voice_id is required and must be a non-empty string".to_owned());
        }
        if !(0.3..=3.0).contains(&self.silence_threshold_secs) {
            problems.push("silence_threshold_secs must be a number between 0.3 and 3.0".to_owned());
        }
        if !(0.1..=0.9).contains(&self.vad_threshold) {
            problems.push("vad_threshold must be a number between 0.1 and 0.9".to_owned());
        }
        if !(0.001..=0.5).contains(&self.local_vad_threshold) {
            problems.push("local_vad_threshold must be a number between 0.001 and 0.5".to_owned());
        }
        if self.latency_optimization > 4 {
            problems.push("latency_optimization must be an integer between 0 and 4".to_owned());
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            problems.push(format!(
                "sample_rate must be one of: {}",
                SUPPORTED_SAMPLE_RATES
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        if !(50..=2_000).contains(&self.min_speech_duration_ms) {
            problems.push("min_speech_duration_ms must be between 50 and 2000".to_owned());
        }
        if self.prefix_padding_ms > 1_000 {
            problems.push("prefix_padding_ms must not exceed 1000".to_owned());
        }
        if self.language_code.trim().is_empty() {
            problems.push("language_code must not be empty".to_owned());
        }
        if self.connection.connect_timeout_ms == 0 {
            problems.push("connection.connect_timeout_ms must be greater than zero".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { problems })
        }
    }

    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed (including
    /// unknown model or format identifiers).
    pub fn from_file(path: &std::path::Path) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError {
            problems: vec![format!("cannot read {}: {e}", path.display())],
        })?;
        toml::from_str(&content).map_err(|e| ConfigError {
            problems: vec![e.to_string()],
        })
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// Credential suppliers are never written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> std::result::Result<(), ConfigError> {
        let io_err = |e: std::io::Error| ConfigError {
            problems: vec![format!("cannot write {}: {e}", path.display())],
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError {
            problems: vec![e.to_string()],
        })?;
        std::fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/voxline/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("voxline-config"))
            .join("voxline")
            .join("config.toml")
    }
}
