//! Microphone capture, speaker playback and PCM helpers via cpal.

pub mod capture;
pub mod pcm;
pub mod playback;
