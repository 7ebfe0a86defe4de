//! Voxline: real-time voice conversation mode.
//!
//! Turns a text chat into a spoken conversation:
//! Microphone → VAD → realtime STT → (conversational backend) → TTS → Speaker
//!
//! # Architecture
//!
//! The session is built from independent components connected by async
//! channels:
//! - **Audio capture**: records from the microphone via `cpal`, downsamples
//!   and runs a local energy VAD used for barge-in
//! - **Transcription**: streams PCM over a WebSocket and receives partial
//!   and committed transcripts
//! - **Speech**: synthesizes reply text over HTTP and plays it in strict
//!   FIFO order, stoppable within one output buffer
//! - **Session**: a [`VoiceSession`] state machine wiring the above, with
//!   progressive sentence segmentation of streamed replies

pub mod audio;
pub mod config;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::{TokenProvider, VoiceConfig};
pub use error::{Result, VoiceError, VoiceErrorCode};
pub use pipeline::messages::{SessionSnapshot, VoiceEvent};
pub use pipeline::state::VoiceSessionState;
pub use pipeline::{SessionInfo, VoiceComponents, VoiceSession};
