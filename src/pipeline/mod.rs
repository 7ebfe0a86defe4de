//! Session orchestration: state machine, events, text segmentation.

pub mod coordinator;
pub mod messages;
pub mod segmenter;
pub mod state;

pub use coordinator::{SessionInfo, VoiceComponents, VoiceSession};
