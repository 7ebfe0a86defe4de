//! Transcription socket against a local WebSocket server.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use voxline::VoiceConfig;
use voxline::error::VoiceErrorCode;
use voxline::pipeline::messages::AudioFrame;
use voxline::stt::{TranscriptEvent, TranscriptionConnection, TranscriptionLink};

const WAIT: Duration = Duration::from_secs(3);

struct Server {
    listener: TcpListener,
    config: VoiceConfig,
}

impl Server {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = VoiceConfig::new("voice-test");
        config.endpoints.stt_url = format!("ws://{addr}/v1/speech-to-text/realtime");
        config.connection.connect_timeout_ms = 2_000;
        Self { listener, config }
    }

    /// Accept one client, recording the request URI.
    async fn accept(&self, uri: Arc<Mutex<Option<String>>>) -> WebSocketStream<TcpStream> {
        let (stream, _) = self.listener.accept().await.unwrap();
        let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *uri.lock().unwrap() = Some(req.uri().to_string());
            Ok(resp)
        };
        tokio_tungstenite::accept_hdr_async(stream, record).await.unwrap()
    }

    /// Accept one client and reject the upgrade with `status`.
    async fn reject(&self, status: u16) {
        let (stream, _) = self.listener.accept().await.unwrap();
        let deny = move |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
            Err(http::Response::builder()
                .status(status)
                .body(Some("denied".to_owned()))
                .unwrap())
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, deny).await;
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn next_event(rx: &mut mpsc::Receiver<TranscriptEvent>) -> TranscriptEvent {
    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

#[tokio::test]
async fn session_streams_audio_and_transcripts() {
    let server = Server::bind().await;
    let config = server.config.clone();
    let uri = Arc::new(Mutex::new(None));

    let server_uri = Arc::clone(&uri);
    let server_task = tokio::spawn(async move {
        let mut ws = server.accept(server_uri).await;
        send_json(
            &mut ws,
            json!({"message_type": "session_started", "session_id": "sess-1", "config": {"sample_rate": 16000}}),
        )
        .await;

        // One audio chunk, then one explicit commit.
        let mut chunks = Vec::new();
        while chunks.len() < 2 {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => chunks.push(serde_json::from_str::<Value>(&text).unwrap()),
                _ => continue,
            }
        }

        send_json(&mut ws, json!({"message_type": "partial_transcript", "text": "bom"})).await;
        send_json(&mut ws, json!({"message_type": "some_future_kind", "x": 1})).await;
        send_json(
            &mut ws,
            json!({
                "message_type": "committed_transcript_with_timestamps",
                "text": "bom dia",
                "language_code": "pt",
                "words": [{"text": "bom", "start": 0.0, "end": 0.2, "type": "word"}]
            }),
        )
        .await;

        let close = loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {other:?}"),
            }
        };
        (chunks, close)
    });

    let (tx, mut rx) = mpsc::channel(16);
    let conn = TranscriptionConnection::connect(&config, Some("tok-1"), tx).await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.session_id().as_deref(), Some("sess-1"));

    let uri = uri.lock().unwrap().clone().unwrap();
    assert!(uri.starts_with("/v1/speech-to-text/realtime?"));
    assert!(uri.contains("token=tok-1"));
    assert!(uri.contains("commit_strategy=vad"));
    assert!(uri.contains("vad_silence_duration_ms=1500"));

    match next_event(&mut rx).await {
        TranscriptEvent::SessionStarted { session_id, config } => {
            assert_eq!(session_id, "sess-1");
            assert_eq!(config["sample_rate"], 16000);
        }
        other => panic!("unexpected {other:?}"),
    }

    let frame = AudioFrame {
        samples: vec![0, 1, -1, i16::MAX],
        sample_rate: 16_000,
        has_voice: true,
    };
    conn.send_audio(&frame, false);
    conn.commit();

    assert_eq!(next_event(&mut rx).await, TranscriptEvent::Partial { text: "bom".into() });
    match next_event(&mut rx).await {
        TranscriptEvent::Committed {
            text,
            language_code,
            words,
        } => {
            assert_eq!(text, "bom dia");
            assert_eq!(language_code.as_deref(), Some("pt"));
            let words = words.unwrap();
            assert_eq!(words.len(), 1);
            assert_eq!(words[0].kind.as_deref(), Some("word"));
        }
        other => panic!("unexpected {other:?}"),
    }

    conn.disconnect().await;
    conn.disconnect().await;
    assert!(!conn.is_connected());
    assert_eq!(conn.session_id(), None);

    let (chunks, close) = server_task.await.unwrap();
    assert_eq!(chunks[0]["message_type"], "input_audio_chunk");
    assert_eq!(chunks[0]["sample_rate"], 16000);
    let audio = base64::engine::general_purpose::STANDARD
        .decode(chunks[0]["audio_base_64"].as_str().unwrap())
        .unwrap();
    assert_eq!(audio, vec![0, 0, 1, 0, 0xff, 0xff, 0xff, 0x7f]);
    assert_eq!(chunks[1]["audio_base_64"], "");
    assert_eq!(chunks[1]["commit"], true);

    let close = close.unwrap();
    assert_eq!(close.code, CloseCode::Normal);
    assert_eq!(close.reason, "Client disconnect");

    // A client-initiated close is not reported as a remote close.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn remote_close_is_reported_with_code() {
    let server = Server::bind().await;
    let config = server.config.clone();

    tokio::spawn(async move {
        let mut ws = server.accept(Arc::new(Mutex::new(None))).await;
        send_json(&mut ws, json!({"message_type": "session_started", "session_id": "sess-2"})).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "restarting".into(),
        }))
        .await
        .unwrap();
        // Drain until the client acknowledges.
        while ws.next().await.is_some() {}
    });

    let (tx, mut rx) = mpsc::channel(16);
    let conn = TranscriptionConnection::connect(&config, None, tx).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, TranscriptEvent::SessionStarted { .. }));
    assert_eq!(
        next_event(&mut rx).await,
        TranscriptEvent::Closed {
            code: 1011,
            reason: "restarting".into()
        }
    );
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn dropped_transport_reads_as_abnormal_close() {
    let server = Server::bind().await;
    let config = server.config.clone();

    tokio::spawn(async move {
        let mut ws = server.accept(Arc::new(Mutex::new(None))).await;
        send_json(&mut ws, json!({"message_type": "session_started", "session_id": "sess-4"})).await;
        // No close handshake: the TCP stream just goes away.
        drop(ws);
    });

    let (tx, mut rx) = mpsc::channel(16);
    let conn = TranscriptionConnection::connect(&config, None, tx).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, TranscriptEvent::SessionStarted { .. }));

    match next_event(&mut rx).await {
        TranscriptEvent::Closed { code, .. } => assert_eq!(code, 1006),
        other => panic!("expected abnormal close, got {other:?}"),
    }
    assert!(!conn.is_connected());
    assert!(!matches!(rx.try_recv(), Ok(TranscriptEvent::Error(_))));
}

#[tokio::test]
async fn service_errors_are_classified() {
    let server = Server::bind().await;
    let config = server.config.clone();

    tokio::spawn(async move {
        let mut ws = server.accept(Arc::new(Mutex::new(None))).await;
        send_json(&mut ws, json!({"message_type": "session_started", "session_id": "sess-3"})).await;
        send_json(&mut ws, json!({"message_type": "scribe_quota_exceeded_error", "error": "quota used up"})).await;
        send_json(&mut ws, json!({"message_type": "scribe_error", "error": "decoder crashed"})).await;
        while ws.next().await.is_some() {}
    });

    let (tx, mut rx) = mpsc::channel(16);
    let conn = TranscriptionConnection::connect(&config, None, tx).await.unwrap();
    next_event(&mut rx).await;

    let TranscriptEvent::Error(quota) = next_event(&mut rx).await else {
        panic!("expected error event");
    };
    assert_eq!(quota.code, VoiceErrorCode::RateLimited);
    assert_eq!(quota.message, "quota used up");

    let TranscriptEvent::Error(failed) = next_event(&mut rx).await else {
        panic!("expected error event");
    };
    assert_eq!(failed.code, VoiceErrorCode::TranscriptionFailed);
    assert!(failed.recoverable);
    conn.disconnect().await;
}

#[tokio::test]
async fn auth_error_before_ready_fails_connect() {
    let server = Server::bind().await;
    let config = server.config.clone();

    tokio::spawn(async move {
        let mut ws = server.accept(Arc::new(Mutex::new(None))).await;
        send_json(&mut ws, json!({"message_type": "scribe_auth_error", "error": "token expired"})).await;
        while ws.next().await.is_some() {}
    });

    let (tx, _rx) = mpsc::channel(16);
    let err = TranscriptionConnection::connect(&config, Some("stale"), tx)
        .await
        .err()
        .unwrap();
    assert_eq!(err.code, VoiceErrorCode::TokenExpired);
}

#[tokio::test]
async fn handshake_rejections_map_to_codes() {
    for (status, code) in [
        (401, VoiceErrorCode::TokenExpired),
        (429, VoiceErrorCode::RateLimited),
        (500, VoiceErrorCode::TranscriptionConnectionFailed),
    ] {
        let server = Server::bind().await;
        let config = server.config.clone();
        tokio::spawn(async move { server.reject(status).await });

        let (tx, _rx) = mpsc::channel(16);
        let err = TranscriptionConnection::connect(&config, None, tx).await.err().unwrap();
        assert_eq!(err.code, code, "status {status}");
    }
}

#[tokio::test]
async fn silent_server_times_out() {
    let mut server = Server::bind().await;
    server.config.connection.connect_timeout_ms = 100;
    let config = server.config.clone();

    tokio::spawn(async move {
        let _ws = server.accept(Arc::new(Mutex::new(None))).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let (tx, _rx) = mpsc::channel(16);
    let err = TranscriptionConnection::connect(&config, None, tx).await.err().unwrap();
    assert_eq!(err.code, VoiceErrorCode::TranscriptionConnectionFailed);
    assert!(err.message.contains("timeout"));
}
