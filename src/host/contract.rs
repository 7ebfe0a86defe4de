//! Versioned command/response/event envelopes for the host bridge.

use crate::pipeline::messages::{AudioDevices, SessionSnapshot, VoiceEvent};
use serde::{Deserialize, Serialize};

/// Contract version for host envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Commands accepted from the embedding process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    Start,
    End,
    Speak {
        text: String,
    },
    Chunk {
        text: String,
        #[serde(default)]
        complete: bool,
    },
    StopSpeaking,
    Pause,
    Resume,
    Snapshot,
    Devices,
    Shutdown,
}

impl HostCommand {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Speak { .. } => "speak",
            Self::Chunk { .. } => "chunk",
            Self::StopSpeaking => "stop_speaking",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Snapshot => "snapshot",
            Self::Devices => "devices",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A command line from the embedding process.
///
/// `{"request_id": "r1", "command": "speak", "text": "Hello."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub command: HostCommand,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(request_id: impl Into<String>, command: HostCommand) -> Self {
        Self {
            request_id: Some(request_id.into()),
            command,
        }
    }
}

/// Reply to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SessionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<AudioDevices>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: Option<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id,
            ok: true,
            error: None,
            snapshot: None,
            devices: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(request_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id,
            ok: false,
            error: Some(message.into()),
            snapshot: None,
            devices: None,
        }
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Option<SessionSnapshot>) -> Self {
        self.snapshot = snapshot;
        self
    }

    #[must_use]
    pub fn with_devices(mut self, devices: AudioDevices) -> Self {
        self.devices = Some(devices);
        self
    }
}

/// A session event pushed to the embedding process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event: VoiceEvent,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(event: VoiceEvent) -> Self {
        Self {
            v: EVENT_VERSION,
            event,
        }
    }
}
