//! Message types passed between session components and to the UI.

use crate::error::VoiceError;
use crate::pipeline::state::VoiceSessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chunk of 16-bit PCM from the microphone, at the session sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Mono signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Local VAD judged this frame to contain voice.
    pub has_voice: bool,
}

impl AudioFrame {
    /// Frame length in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }
}

/// Everything the session reports to its observers.
///
/// Serialized with a `type` tag so a UI process can consume the stream as
/// JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VoiceEvent {
    #[serde(rename = "session:started")]
    SessionStarted {
        id: String,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "session:ended")]
    SessionEnded { id: String, duration_ms: u64 },
    #[serde(rename = "state:changed")]
    StateChanged {
        state: VoiceSessionState,
        previous: VoiceSessionState,
    },
    #[serde(rename = "listening:started")]
    ListeningStarted,
    #[serde(rename = "listening:stopped")]
    ListeningStopped,
    #[serde(rename = "transcript:partial")]
    TranscriptPartial { text: String },
    #[serde(rename = "transcript:committed")]
    TranscriptCommitted { text: String },
    #[serde(rename = "speaking:started")]
    SpeakingStarted { text: String },
    #[serde(rename = "speaking:ended")]
    SpeakingEnded,
    #[serde(rename = "barge-in")]
    BargeIn,
    #[serde(rename = "error")]
    Error { error: VoiceError },
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: VoiceSessionState,
    pub started_at: DateTime<Utc>,
    /// Latest partial transcript (replaced wholesale on each update).
    pub partial_transcript: String,
    pub is_playing: bool,
    pub listening_paused: bool,
    pub last_error: Option<VoiceError>,
}

/// Audio devices the session's backends can see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevices {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}
