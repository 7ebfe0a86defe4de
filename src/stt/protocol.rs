//! Wire format of the realtime transcription WebSocket.

use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError, VoiceErrorCode, classify_socket_message};
use serde::{Deserialize, Serialize};
use url::Url;

/// Word-level timing attached to timestamped commits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WordTiming {
    pub text: String,
    pub start: f64,
    pub end: f64,
    /// `word` or `spacing`, when the service reports it.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Messages received from the service, keyed by `message_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionStarted {
        session_id: String,
        #[serde(default)]
        config: serde_json::Value,
    },
    PartialTranscript {
        #[serde(default)]
        text: String,
    },
    CommittedTranscript {
        #[serde(default)]
        text: String,
    },
    CommittedTranscriptWithTimestamps {
        #[serde(default)]
        text: String,
        #[serde(default)]
        language_code: Option<String>,
        #[serde(default)]
        words: Vec<WordTiming>,
    },
    ScribeError {
        #[serde(default)]
        error: String,
    },
    ScribeAuthError {
        #[serde(default)]
        error: String,
    },
    ScribeRateLimitedError {
        #[serde(default)]
        error: String,
    },
    ScribeThrottledError {
        #[serde(default)]
        error: String,
    },
    ScribeQuotaExceededError {
        #[serde(default)]
        error: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Classify error kinds; `None` for non-error messages.
    pub fn as_error(&self) -> Option<VoiceError> {
        let (code, detail) = match self {
            Self::ScribeAuthError { error } => (VoiceErrorCode::TokenExpired, error),
            Self::ScribeRateLimitedError { error }
            | Self::ScribeThrottledError { error }
            | Self::ScribeQuotaExceededError { error } => (VoiceErrorCode::RateLimited, error),
            // Link-level codes are reserved for transport failures.
            Self::ScribeError { error } => {
                let code = match classify_socket_message(error) {
                    code @ (VoiceErrorCode::TokenExpired | VoiceErrorCode::RateLimited) => code,
                    _ => VoiceErrorCode::TranscriptionFailed,
                };
                (code, error)
            }
            _ => return None,
        };
        Some(if detail.is_empty() {
            VoiceError::new(code)
        } else {
            VoiceError::with_message(code, detail.clone())
        })
    }
}

/// Outbound audio chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputAudioChunk {
    message_type: &'static str,
    pub audio_base_64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub commit: bool,
}

impl InputAudioChunk {
    pub fn audio(audio_base_64: String, sample_rate: u32, commit: bool) -> Self {
        Self {
            message_type: "input_audio_chunk",
            audio_base_64,
            sample_rate: Some(sample_rate),
            commit,
        }
    }

    /// Empty chunk that forces the current utterance to commit.
    pub fn commit_only() -> Self {
        Self {
            message_type: "input_audio_chunk",
            audio_base_64: String::new(),
            sample_rate: None,
            commit: true,
        }
    }
}

/// Build the connection URL with model, language, credentials and VAD tuning.
///
/// # Errors
///
/// Returns `transcription-connection-failed` if the configured base URL is
/// not a valid URL.
pub fn build_url(config: &VoiceConfig, token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(&config.endpoints.stt_url).map_err(|e| {
        VoiceError::with_message(
            VoiceErrorCode::TranscriptionConnectionFailed,
            format!("invalid transcription URL '{}': {e}", config.endpoints.stt_url),
        )
    })?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("model_id", config.stt_model.as_str());
        q.append_pair("language_code", &config.language_code);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            q.append_pair("token", token);
        }
        q.append_pair("commit_strategy", "vad");
        q.append_pair("vad_threshold", &config.vad_threshold.to_string());
        q.append_pair("vad_silence_duration_ms", &config.silence_duration_ms().to_string());
        q.append_pair(
            "vad_min_speech_duration_ms",
            &config.min_speech_duration_ms.to_string(),
        );
        q.append_pair("vad_prefix_padding_ms", &config.prefix_padding_ms.to_string());
    }
    Ok(url)
}
