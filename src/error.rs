//! Error taxonomy for voice sessions.
//!
//! Every leaf component (capture, transcription, synthesis) classifies its
//! own failures into a [`VoiceErrorCode`] before surfacing them. The session
//! orchestrator never re-interprets codes; it only decides what the failure
//! means for the state machine.
//!
//! Codes are kebab-case strings and form part of the public event contract.

use serde::{Deserialize, Serialize};

/// Stable classification of every voice-mode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceErrorCode {
    /// The user (or OS) refused microphone access.
    MicrophonePermissionDenied,
    /// No input device is present.
    MicrophoneNotFound,
    /// The platform has no usable audio host.
    PlatformNotSupported,
    /// The transcription socket could not be opened or became unusable.
    TranscriptionConnectionFailed,
    /// The transcription service rejected or failed an utterance.
    TranscriptionFailed,
    /// Speech synthesis or decoding failed for an utterance.
    SynthesisFailed,
    /// Transport-level network failure.
    NetworkError,
    /// Authentication token rejected or expired.
    TokenExpired,
    /// Remote side throttled the client.
    RateLimited,
    /// Anything not covered above.
    Unknown,
}

impl VoiceErrorCode {
    /// Stable string form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MicrophonePermissionDenied => "microphone-permission-denied",
            Self::MicrophoneNotFound => "microphone-not-found",
            Self::PlatformNotSupported => "platform-not-supported",
            Self::TranscriptionConnectionFailed => "transcription-connection-failed",
            Self::TranscriptionFailed => "transcription-failed",
            Self::SynthesisFailed => "synthesis-failed",
            Self::NetworkError => "network-error",
            Self::TokenExpired => "token-expired",
            Self::RateLimited => "rate-limited",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the session can carry on (or be retried) after this failure.
    ///
    /// Missing hardware and unsupported platforms need a different machine or
    /// device; everything else may succeed on retry.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::MicrophoneNotFound | Self::PlatformNotSupported)
    }

    /// Default user-facing message.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::MicrophonePermissionDenied => "Microphone access was denied",
            Self::MicrophoneNotFound => "No microphone was found",
            Self::PlatformNotSupported => "Voice mode is not supported on this platform",
            Self::TranscriptionConnectionFailed => {
                "Could not connect to the speech recognition service"
            }
            Self::TranscriptionFailed => "Speech recognition failed",
            Self::SynthesisFailed => "Could not generate speech",
            Self::NetworkError => "Network connection lost",
            Self::TokenExpired => "Authentication expired",
            Self::RateLimited => "Too many requests",
            Self::Unknown => "An unexpected error occurred",
        }
    }

    /// Remediation hint shown next to the message.
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::MicrophonePermissionDenied => {
                "Allow microphone access in your system settings and try again"
            }
            Self::MicrophoneNotFound => "Connect a microphone and try again",
            Self::PlatformNotSupported => "Use a device with a supported audio input",
            Self::TranscriptionConnectionFailed => "Check your connection and try again",
            Self::TranscriptionFailed => "Please try speaking again",
            Self::SynthesisFailed => "The reply will be shown as text",
            Self::NetworkError => "Check your internet connection",
            Self::TokenExpired => "Reconnecting...",
            Self::RateLimited => "Wait a moment and try again",
            Self::Unknown => "Please try again",
        }
    }
}

impl std::fmt::Display for VoiceErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified voice-mode failure, ready for display.
///
/// The Display impl formats as `[code] message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct VoiceError {
    /// Taxonomy code.
    pub code: VoiceErrorCode,
    /// User-facing message (default for the code unless overridden).
    pub message: String,
    /// Remediation suggestion.
    pub suggestion: String,
    /// Whether the failure is recoverable.
    pub recoverable: bool,
}

impl VoiceError {
    /// Build an error carrying the code's default message.
    pub fn new(code: VoiceErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_owned(),
            suggestion: code.suggestion().to_owned(),
            recoverable: code.is_recoverable(),
        }
    }

    /// Build an error with a custom message; suggestion and recoverability
    /// still come from the code.
    pub fn with_message(code: VoiceErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::new(code)
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Platform-level reasons a microphone could not be acquired.
///
/// Capture backends translate their native errors into one of these; the
/// taxonomy mapping happens in exactly one place ([`from_capture_failure`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFailure {
    /// The OS refused access to the device.
    PermissionDenied(String),
    /// No device, or the named device disappeared.
    DeviceNotFound(String),
    /// No audio host, or the stream configuration cannot be satisfied.
    Unsupported(String),
    /// Anything else.
    Other(String),
}

/// Map a platform capture failure onto the taxonomy.
pub fn from_capture_failure(failure: CaptureFailure) -> VoiceError {
    match failure {
        CaptureFailure::PermissionDenied(detail) => {
            tracing::debug!(%detail, "microphone permission denied");
            VoiceError::new(VoiceErrorCode::MicrophonePermissionDenied)
        }
        CaptureFailure::DeviceNotFound(detail) => {
            tracing::debug!(%detail, "microphone not found");
            VoiceError::new(VoiceErrorCode::MicrophoneNotFound)
        }
        CaptureFailure::Unsupported(detail) => {
            tracing::debug!(%detail, "audio platform not supported");
            VoiceError::new(VoiceErrorCode::PlatformNotSupported)
        }
        CaptureFailure::Other(detail) => {
            VoiceError::with_message(VoiceErrorCode::Unknown, format!("audio capture failed: {detail}"))
        }
    }
}

/// Classify a transcription-socket failure from its message text.
pub fn classify_socket_message(message: &str) -> VoiceErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("token") {
        return VoiceErrorCode::TokenExpired;
    }
    if lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("throttl")
        || lower.contains("quota")
    {
        return VoiceErrorCode::RateLimited;
    }
    if lower.contains("network") || lower.contains("connection") {
        return VoiceErrorCode::NetworkError;
    }
    VoiceErrorCode::TranscriptionConnectionFailed
}

/// Classify the HTTP status of a rejected WebSocket handshake.
pub fn from_handshake_status(status: u16, detail: &str) -> VoiceError {
    let code = match status {
        401 | 403 => VoiceErrorCode::TokenExpired,
        429 => VoiceErrorCode::RateLimited,
        _ => VoiceErrorCode::TranscriptionConnectionFailed,
    };
    VoiceError::with_message(code, format!("transcription handshake rejected ({status}): {detail}"))
}

/// Classify a non-success synthesis response.
pub fn from_synthesis_status(status: reqwest::StatusCode) -> VoiceError {
    let code = match status.as_u16() {
        401 => VoiceErrorCode::TokenExpired,
        429 => VoiceErrorCode::RateLimited,
        _ => VoiceErrorCode::SynthesisFailed,
    };
    VoiceError::with_message(code, format!("synthesis request failed: {status}"))
}

/// Classify a transport error from the HTTP client.
pub fn from_http_error(err: &reqwest::Error) -> VoiceError {
    if let Some(status) = err.status() {
        return from_synthesis_status(status);
    }
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        return VoiceError::with_message(VoiceErrorCode::NetworkError, format!("network error: {err}"));
    }
    VoiceError::with_message(VoiceErrorCode::SynthesisFailed, format!("synthesis error: {err}"))
}

/// Configuration rejected by validation.
///
/// Carries every problem found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid voice configuration: {}", .problems.join("; "))]
pub struct ConfigError {
    /// One human-readable line per violated rule.
    pub problems: Vec<String>,
}

impl From<ConfigError> for VoiceError {
    fn from(err: ConfigError) -> Self {
        VoiceError::with_message(VoiceErrorCode::Unknown, err.to_string())
    }
}
