//! Session lifecycle state machine.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// States a voice session moves through.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceSessionState {
    /// No session.
    #[default]
    Idle,
    /// Acquiring credentials, microphone and transcription connection.
    Initializing,
    /// Microphone live, waiting for the user.
    Listening,
    /// The user is speaking; an utterance is in flight.
    Processing,
    /// Reserved for the UI: a transcript is being sent to the backend.
    Sending,
    /// Reserved for the UI: waiting on the backend's reply.
    Receiving,
    /// A reply is being played.
    Speaking,
    /// An unrecoverable failure halted the session.
    Error,
}

impl VoiceSessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }

    /// Whether a session exists in this state (anything but idle/error).
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Error)
    }
}

impl std::fmt::Display for VoiceSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal edge.
///
/// Same-state moves are handled by the caller as no-ops and are not edges.
pub fn is_valid_transition(from: VoiceSessionState, to: VoiceSessionState) -> bool {
    use VoiceSessionState::*;
    match (from, to) {
        (_, Error) => true,
        (Idle, Initializing) => true,
        (Initializing, Listening) => true,
        (Listening, Processing) => true,
        (Processing, Listening) => true,
        (Listening | Processing, Speaking) => true,
        (Speaking, Listening) => true,
        (from, Idle) => from != Idle,
        _ => false,
    }
}

/// Outcome of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed from `previous`.
    Changed { previous: VoiceSessionState },
    /// Already in the requested state.
    Unchanged,
    /// Edge not allowed; state left as is.
    Rejected,
}

/// Holds the current state and enforces the edge table.
#[derive(Debug, Default, Clone)]
pub struct SessionStateMachine {
    state: VoiceSessionState,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VoiceSessionState {
        self.state
    }

    /// Attempt to move to `to`. Invalid edges are logged and rejected.
    pub fn transition(&mut self, to: VoiceSessionState) -> Transition {
        let from = self.state;
        if from == to {
            return Transition::Unchanged;
        }
        if !is_valid_transition(from, to) {
            warn!(%from, %to, "rejected invalid voice session transition");
            return Transition::Rejected;
        }
        debug!(%from, %to, "voice session state change");
        self.state = to;
        Transition::Changed { previous: from }
    }

    /// Unconditionally return to idle, e.g. after an errored session is ended.
    pub fn reset(&mut self) -> Option<VoiceSessionState> {
        let previous = self.state;
        self.state = VoiceSessionState::Idle;
        (previous != VoiceSessionState::Idle).then_some(previous)
    }
}
