//! Session lifecycle, transcription, speech and barge-in with fake devices.

use crate::helpers::{CountingTokens, Harness, test_config, wait_until};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use voxline::error::{CaptureFailure, VoiceError, VoiceErrorCode};
use voxline::stt::TranscriptEvent;
use voxline::tts::SpeechOutcome;
use voxline::{VoiceConfig, VoiceEvent, VoiceSessionState};

fn committed(text: &str) -> TranscriptEvent {
    TranscriptEvent::Committed {
        text: text.into(),
        language_code: Some("pt".into()),
        words: None,
    }
}

#[tokio::test]
async fn start_session_opens_everything_and_listens() {
    let mut h = Harness::new();
    let info = h.session.start_session().await.unwrap();

    assert!(info.id.starts_with("voice_"));
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
    assert!(h.mic.is_open());
    assert_eq!(h.connector.tokens.lock().unwrap().as_slice(), &[Some("token-1".to_owned())]);

    let events = h.drain_events();
    let states: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![VoiceSessionState::Initializing, VoiceSessionState::Listening]);
    assert!(events.iter().any(|e| matches!(e, VoiceEvent::SessionStarted { id, .. } if *id == info.id)));
    assert!(matches!(events.last(), Some(VoiceEvent::ListeningStarted)));

    let snapshot = h.session.snapshot().unwrap();
    assert_eq!(snapshot.id, info.id);
    assert_eq!(snapshot.state, VoiceSessionState::Listening);
    assert!(!snapshot.is_playing);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let h = Harness::new();
    h.session.start_session().await.unwrap();
    let err = h.session.start_session().await.unwrap_err();
    assert_eq!(err.code, VoiceErrorCode::Unknown);
    assert!(err.message.contains("already in progress"));
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn permission_denied_leaves_nothing_open() {
    let mut h = Harness::new();
    *h.mic.unavailable.lock().unwrap() = Some(CaptureFailure::PermissionDenied("denied by user".into()));

    let err = h.session.start_session().await.unwrap_err();
    assert_eq!(err.code, VoiceErrorCode::MicrophonePermissionDenied);
    assert!(err.recoverable);
    assert_eq!(h.session.state(), VoiceSessionState::Error);
    assert_eq!(h.mic.opens.load(Ordering::SeqCst), 0);
    assert_eq!(h.connector.attempts(), 0);

    let event = h.expect_event(|e| matches!(e, VoiceEvent::Error { .. })).await;
    let VoiceEvent::Error { error } = event else { unreachable!() };
    assert_eq!(error.code, VoiceErrorCode::MicrophonePermissionDenied);

    // Recoverable: the UI may end and retry.
    *h.mic.unavailable.lock().unwrap() = None;
    h.session.end_session().await;
    assert_eq!(h.session.state(), VoiceSessionState::Idle);
    h.session.start_session().await.unwrap();
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
}

#[tokio::test]
async fn connection_failure_releases_microphone() {
    let h = Harness::new();
    h.connector.failures.store(1, Ordering::SeqCst);

    let err = h.session.start_session().await.unwrap_err();
    assert_eq!(err.code, VoiceErrorCode::TranscriptionConnectionFailed);
    assert_eq!(h.session.state(), VoiceSessionState::Error);
    assert!(!h.mic.is_open());
    assert_eq!(h.session.snapshot(), None);
}

#[tokio::test]
async fn missing_voice_id_has_no_side_effects() {
    let tokens = Arc::new(CountingTokens::default());
    let config = VoiceConfig {
        voice_id: String::new(),
        ..test_config()
    }
    .with_token_provider(tokens.clone());

    let err = Harness::build(config, tokens.clone()).err().unwrap();
    assert_eq!(err.code, VoiceErrorCode::Unknown);
    assert!(err.message.contains("voice_id"));
    assert_eq!(tokens.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn frames_flow_while_listening_and_voice_moves_to_processing() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();
    let link = h.connector.stats(0);

    h.mic.feed(0.0);
    wait_until(|| link.frames.load(Ordering::SeqCst) == 1).await;
    assert_eq!(h.session.state(), VoiceSessionState::Listening);

    h.mic.speak_into();
    h.expect_event(|e| {
        matches!(
            e,
            VoiceEvent::StateChanged {
                state: VoiceSessionState::Processing,
                ..
            }
        )
    })
    .await;
    wait_until(|| link.frames.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn paused_capture_sends_nothing() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();
    let link = h.connector.stats(0);

    h.session.pause_listening();
    h.expect_event(|e| matches!(e, VoiceEvent::ListeningStopped)).await;
    h.mic.speak_into();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.frames.load(Ordering::SeqCst), 0);
    assert!(h.session.snapshot().unwrap().listening_paused);

    h.session.set_muted(false);
    h.expect_event(|e| matches!(e, VoiceEvent::ListeningStarted)).await;
    h.mic.feed(0.0);
    wait_until(|| link.frames.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn transcripts_reach_ui_and_message_sink() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut h = Harness::new();
    h.session.set_message_sink(Some(tx));
    h.session.start_session().await.unwrap();

    h.connector
        .emit(TranscriptEvent::Partial { text: "Olá, tu".into() })
        .await;
    h.expect_event(|e| matches!(e, VoiceEvent::TranscriptPartial { text } if text == "Olá, tu"))
        .await;
    assert_eq!(h.session.snapshot().unwrap().partial_transcript, "Olá, tu");

    h.connector.emit(committed("Olá, tudo bem?")).await;
    h.expect_event(|e| matches!(e, VoiceEvent::TranscriptCommitted { text } if text == "Olá, tudo bem?"))
        .await;
    assert_eq!(rx.recv().await.unwrap(), "Olá, tudo bem?");
    assert_eq!(h.session.snapshot().unwrap().partial_transcript, "");
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
}

#[tokio::test]
async fn empty_commit_returns_to_listening_without_message() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut h = Harness::new();
    h.session.set_message_sink(Some(tx));
    h.session.start_session().await.unwrap();

    h.mic.speak_into();
    h.wait_for_state(VoiceSessionState::Processing).await;

    h.connector.emit(committed("   ")).await;
    h.wait_for_state(VoiceSessionState::Listening).await;
    assert!(rx.try_recv().is_err());
    assert!(!h.drain_events().iter().any(|e| matches!(e, VoiceEvent::TranscriptCommitted { .. })));
}

#[tokio::test]
async fn closed_connection_reconnects_with_fresh_token() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();

    h.connector
        .emit(TranscriptEvent::Closed {
            code: 1011,
            reason: "server restart".into(),
        })
        .await;
    wait_until(|| h.connector.link_count() == 2).await;

    assert_eq!(
        h.connector.tokens.lock().unwrap().as_slice(),
        &[Some("token-1".to_owned()), Some("token-2".to_owned())]
    );
    assert_eq!(h.session.state(), VoiceSessionState::Listening);

    // The new connection carries audio once it is installed.
    let link = h.connector.stats(1);
    wait_until(|| {
        h.mic.feed(0.0);
        link.frames.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert_eq!(h.connector.stats(0).frames.load(Ordering::SeqCst), 0);
    assert!(!h.drain_events().iter().any(|e| matches!(e, VoiceEvent::Error { .. })));
}

#[tokio::test]
async fn lost_transport_reconnects_without_user_facing_error() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();

    h.connector
        .emit(TranscriptEvent::Error(VoiceError::with_message(
            VoiceErrorCode::NetworkError,
            "Connection reset without closing handshake",
        )))
        .await;
    h.connector
        .emit(TranscriptEvent::Closed {
            code: 1006,
            reason: "Connection reset without closing handshake".into(),
        })
        .await;
    wait_until(|| h.connector.link_count() == 2).await;

    assert_eq!(h.session.state(), VoiceSessionState::Listening);
    assert_eq!(h.session.snapshot().unwrap().last_error, None);
    assert!(!h.drain_events().iter().any(|e| matches!(e, VoiceEvent::Error { .. })));
}

#[tokio::test]
async fn service_reported_error_still_reaches_ui() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();

    h.connector
        .emit(TranscriptEvent::Error(VoiceError::with_message(
            VoiceErrorCode::TranscriptionFailed,
            "decoder crashed",
        )))
        .await;
    let VoiceEvent::Error { error } = h.expect_event(|e| matches!(e, VoiceEvent::Error { .. })).await else {
        unreachable!()
    };
    assert_eq!(error.code, VoiceErrorCode::TranscriptionFailed);
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
}

#[tokio::test]
async fn exhausted_reconnect_reports_recoverable_error() {
    let mut h = Harness::with_config(|c| c.connection.max_reconnect_attempts = 2);
    h.session.start_session().await.unwrap();
    h.connector.failures.store(10, Ordering::SeqCst);

    h.connector
        .emit(TranscriptEvent::Closed {
            code: 1006,
            reason: String::new(),
        })
        .await;

    let event = h.expect_event(|e| matches!(e, VoiceEvent::Error { .. })).await;
    let VoiceEvent::Error { error } = event else { unreachable!() };
    assert_eq!(error.code, VoiceErrorCode::TranscriptionConnectionFailed);
    assert!(error.recoverable);
    assert_eq!(h.connector.attempts(), 3);
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
    assert_eq!(h.session.snapshot().unwrap().last_error.unwrap().code, error.code);
}

#[tokio::test]
async fn unrecoverable_transcription_error_parks_in_error() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();

    h.connector
        .emit(TranscriptEvent::Error(VoiceError::new(VoiceErrorCode::PlatformNotSupported)))
        .await;
    h.expect_event(|e| matches!(e, VoiceEvent::Error { .. })).await;
    h.wait_for_state(VoiceSessionState::Error).await;
    assert!(!h.mic.is_open());
    wait_until(|| h.connector.stats(0).disconnects.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn speech_plays_in_fifo_order_then_listens() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();

    let handles: Vec<_> = ["One.", "Two.", "Three."]
        .iter()
        .map(|t| h.session.speak(t).unwrap())
        .collect();
    assert_eq!(h.session.state(), VoiceSessionState::Speaking);

    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Completed);
    }
    assert_eq!(h.synth.texts(), vec!["One.", "Two.", "Three."]);
    assert_eq!(h.output.completed.load(Ordering::SeqCst), 3);

    h.wait_for_state(VoiceSessionState::Listening).await;
    let events = h.drain_events();
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::SpeakingStarted { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["One.", "Two.", "Three."]);
    assert_eq!(events.iter().filter(|e| matches!(e, VoiceEvent::SpeakingEnded)).count(), 3);
}

#[tokio::test]
async fn streamed_reply_is_spoken_sentence_by_sentence() {
    let h = Harness::new();
    h.session.start_session().await.unwrap();

    let first = h.session.process_text_chunk("Hello there. How are ", false).unwrap();
    assert_eq!(first.len(), 1);
    let rest = h.session.process_text_chunk("you today?", true).unwrap();
    assert_eq!(rest.len(), 1);

    for handle in first.into_iter().chain(rest) {
        assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Completed);
    }
    assert_eq!(h.synth.texts(), vec!["Hello there.", "How are you today?"]);
}

#[tokio::test]
async fn terminated_chunk_is_spoken_without_completion_flag() {
    let h = Harness::new();
    h.session.start_session().await.unwrap();

    let first = h.session.process_text_chunk("Hello there. How are ", false).unwrap();
    let rest = h.session.process_text_chunk("you today?", false).unwrap();
    assert_eq!(rest.len(), 1);
    assert!(h.session.process_text_chunk("", true).unwrap().is_empty());

    for handle in first.into_iter().chain(rest) {
        assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Completed);
    }
    assert_eq!(h.synth.texts(), vec!["Hello there.", "How are you today?"]);
}

#[tokio::test]
async fn barge_in_cuts_playback_and_resumes_listening() {
    let mut h = Harness::new();
    *h.output.delay.lock().unwrap() = Duration::from_secs(30);
    h.session.start_session().await.unwrap();

    let current = h.session.speak("A very long answer.").unwrap();
    let queued = h.session.speak("And more.").unwrap();
    h.expect_event(|e| matches!(e, VoiceEvent::SpeakingStarted { .. })).await;

    h.mic.speak_into();
    h.expect_event(|e| matches!(e, VoiceEvent::BargeIn)).await;

    let outcome = tokio::time::timeout(Duration::from_millis(500), current.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SpeechOutcome::Cancelled);
    assert_eq!(queued.wait().await.unwrap(), SpeechOutcome::Cancelled);
    assert_eq!(h.output.interrupted.load(Ordering::SeqCst), 1);
    assert_eq!(h.synth.texts(), vec!["A very long answer."]);

    h.expect_event(|e| matches!(e, VoiceEvent::ListeningStarted)).await;
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
    assert!(!h.session.snapshot().unwrap().is_playing);
    // The interrupting speech itself goes to transcription.
    wait_until(|| h.connector.stats(0).frames.load(Ordering::SeqCst) >= 1).await;
}

#[tokio::test]
async fn barge_in_disabled_keeps_speaking() {
    let mut h = Harness::with_config(|c| c.enable_barge_in = false);
    *h.output.delay.lock().unwrap() = Duration::from_millis(300);
    h.session.start_session().await.unwrap();

    let handle = h.session.speak("Let me finish.").unwrap();
    h.expect_event(|e| matches!(e, VoiceEvent::SpeakingStarted { .. })).await;
    h.mic.speak_into();

    assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Completed);
    assert!(!h.drain_events().iter().any(|e| matches!(e, VoiceEvent::BargeIn)));
}

#[tokio::test]
async fn committed_transcript_during_playback_interrupts() {
    let mut h = Harness::new();
    *h.output.delay.lock().unwrap() = Duration::from_secs(30);
    h.session.start_session().await.unwrap();

    let handle = h.session.speak("Talking over you.").unwrap();
    h.expect_event(|e| matches!(e, VoiceEvent::SpeakingStarted { .. })).await;

    h.connector.emit(committed("Espera.")).await;
    h.expect_event(|e| matches!(e, VoiceEvent::BargeIn)).await;
    h.expect_event(|e| matches!(e, VoiceEvent::TranscriptCommitted { .. })).await;
    assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Cancelled);
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
}

#[tokio::test]
async fn committed_transcript_without_barge_in_lets_reply_finish() {
    let mut h = Harness::with_config(|c| c.enable_barge_in = false);
    *h.output.delay.lock().unwrap() = Duration::from_millis(300);
    h.session.start_session().await.unwrap();

    let handle = h.session.speak("Let me finish.").unwrap();
    h.expect_event(|e| matches!(e, VoiceEvent::SpeakingStarted { .. })).await;

    h.connector.emit(committed("Espera.")).await;
    h.expect_event(|e| matches!(e, VoiceEvent::TranscriptCommitted { .. })).await;
    assert_eq!(h.session.state(), VoiceSessionState::Speaking);

    assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Completed);
    h.wait_for_state(VoiceSessionState::Listening).await;
    assert!(!h.drain_events().iter().any(|e| matches!(e, VoiceEvent::BargeIn)));
}

#[tokio::test]
async fn stop_speaking_is_silent_and_drops_pending_text() {
    let mut h = Harness::new();
    *h.output.delay.lock().unwrap() = Duration::from_secs(30);
    h.session.start_session().await.unwrap();

    let handles = h.session.process_text_chunk("First. Second", false).unwrap();
    h.expect_event(|e| matches!(e, VoiceEvent::SpeakingStarted { .. })).await;
    h.session.stop_speaking();

    for handle in handles {
        assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Cancelled);
    }
    assert_eq!(h.session.state(), VoiceSessionState::Listening);
    assert!(!h.drain_events().iter().any(|e| matches!(e, VoiceEvent::BargeIn)));

    // The dropped fragment does not leak into the next reply.
    *h.output.delay.lock().unwrap() = Duration::from_millis(1);
    let next = h.session.process_text_chunk("Fresh.", true).unwrap();
    for handle in next {
        handle.wait().await.unwrap();
    }
    assert_eq!(h.synth.texts().last().map(String::as_str), Some("Fresh."));
}

#[tokio::test]
async fn synthesis_failure_is_reported_and_queue_continues() {
    let mut h = Harness::new();
    h.session.start_session().await.unwrap();

    let failing = h.session.speak("fail this one.").unwrap();
    let next = h.session.speak("This works.").unwrap();

    let err = failing.wait().await.unwrap_err();
    assert_eq!(err.code, VoiceErrorCode::SynthesisFailed);
    assert_eq!(next.wait().await.unwrap(), SpeechOutcome::Completed);

    let event = h.expect_event(|e| matches!(e, VoiceEvent::Error { .. })).await;
    let VoiceEvent::Error { error } = event else { unreachable!() };
    assert!(error.recoverable);
    h.wait_for_state(VoiceSessionState::Listening).await;
}

#[tokio::test]
async fn without_auto_listen_capture_pauses_after_reply() {
    let mut h = Harness::with_config(|c| c.auto_listen = false);
    h.session.start_session().await.unwrap();

    h.session.speak("Done.").unwrap().wait().await.unwrap();
    h.wait_for_state(VoiceSessionState::Listening).await;
    h.expect_event(|e| matches!(e, VoiceEvent::ListeningStopped)).await;
    assert!(h.session.snapshot().unwrap().listening_paused);

    h.session.resume_listening();
    assert!(!h.session.snapshot().unwrap().listening_paused);
}

#[tokio::test]
async fn speaking_requires_an_active_session() {
    let h = Harness::new();
    let err = h.session.speak("Hello.").unwrap_err();
    assert_eq!(err.code, VoiceErrorCode::Unknown);
    assert!(h.session.process_text_chunk("Hello.", true).is_err());
    assert!(h.synth.texts().is_empty());
}

#[tokio::test]
async fn end_session_tears_down_once() {
    let mut h = Harness::new();
    let info = h.session.start_session().await.unwrap();
    *h.output.delay.lock().unwrap() = Duration::from_secs(30);
    let handle = h.session.speak("Interrupted by the end.").unwrap();

    h.session.end_session().await;
    h.session.end_session().await;

    assert_eq!(handle.wait().await.unwrap(), SpeechOutcome::Cancelled);
    assert_eq!(h.session.state(), VoiceSessionState::Idle);
    assert!(!h.mic.is_open());
    assert_eq!(h.connector.stats(0).disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.snapshot(), None);

    let events = h.drain_events();
    let ended: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, VoiceEvent::SessionEnded { id, .. } if *id == info.id))
        .collect();
    assert_eq!(ended.len(), 1);
    assert!(matches!(events.last(), Some(VoiceEvent::ListeningStopped)));
}

#[tokio::test]
async fn end_before_start_is_a_no_op() {
    let mut h = Harness::new();
    h.session.end_session().await;
    assert_eq!(h.session.state(), VoiceSessionState::Idle);
    assert!(h.drain_events().is_empty());
}

#[tokio::test]
async fn destroy_ends_and_refuses_new_sessions() {
    let h = Harness::new();
    h.session.start_session().await.unwrap();
    h.session.destroy().await;
    assert_eq!(h.session.state(), VoiceSessionState::Idle);
    assert!(!h.mic.is_open());

    let err = h.session.start_session().await.unwrap_err();
    assert_eq!(err.code, VoiceErrorCode::Unknown);
    assert!(err.message.contains("destroyed"));
    assert_eq!(h.session.state(), VoiceSessionState::Idle);
    assert_eq!(h.mic.opens.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.attempts(), 1);

    assert!(h.session.speak("Hello.").is_err());
    assert!(h.session.process_text_chunk("Hello.", true).is_err());
    assert_eq!(h.session.state(), VoiceSessionState::Idle);
    assert!(h.synth.texts().is_empty());
}

#[tokio::test]
async fn audio_devices_come_from_both_backends() {
    let h = Harness::new();
    let devices = h.session.audio_devices().unwrap();
    assert_eq!(devices.inputs, vec!["Fake Microphone"]);
    assert_eq!(devices.outputs, vec!["Fake Speaker"]);
}
