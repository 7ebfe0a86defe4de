//! Local voice activity detection using RMS energy.
//!
//! Utterance boundaries belong to the transcription service's VAD. This
//! detector only drives barge-in and UI feedback: an RMS threshold plus a
//! speaking latch released by a silence timer.

use crate::audio::pcm;
use std::time::{Duration, Instant};

/// Outcome of feeding one frame to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    /// Nothing to report for this frame.
    None,
    /// Voice crossed the threshold after a quiet period.
    SpeechStarted,
    /// Still below threshold after speech; running silence length.
    Silence { duration_ms: u64 },
    /// Silence outlasted the hangover window; the speaking latch is released.
    SpeechEnded { silence_ms: u64 },
}

/// Per-frame decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadDecision {
    /// Frame RMS exceeded the threshold.
    pub has_voice: bool,
    pub transition: VadTransition,
}

/// RMS voice activity detector with a speaking latch.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    hangover: Duration,
    speaking: bool,
    silence_started: Option<Instant>,
}

impl VoiceActivityDetector {
    /// Create a detector.
    ///
    /// `hangover` is how long silence must last before the speaking latch
    /// releases and a new [`VadTransition::SpeechStarted`] can fire.
    pub fn new(threshold: f32, hangover: Duration) -> Self {
        Self {
            threshold,
            hangover,
            speaking: false,
            silence_started: None,
        }
    }

    /// Whether the latch is currently set.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Clear all history (after barge-in or resume).
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_started = None;
    }

    /// Classify one mono frame captured at `now`.
    pub fn process(&mut self, samples: &[f32], now: Instant) -> VadDecision {
        let has_voice = pcm::detect_voice_activity(samples, self.threshold);

        let transition = if has_voice {
            self.silence_started = None;
            if self.speaking {
                VadTransition::None
            } else {
                self.speaking = true;
                VadTransition::SpeechStarted
            }
        } else if self.speaking {
            let started = *self.silence_started.get_or_insert(now);
            let silence = now.saturating_duration_since(started);
            let duration_ms = silence.as_millis() as u64;
            if silence >= self.hangover {
                self.reset();
                VadTransition::SpeechEnded {
                    silence_ms: duration_ms,
                }
            } else {
                VadTransition::Silence { duration_ms }
            }
        } else {
            VadTransition::None
        };

        VadDecision {
            has_voice,
            transition,
        }
    }
}
