//! Realtime speech-to-text over a WebSocket.
//!
//! A [`TranscriptionConnection`] streams PCM frames to the service and turns
//! its replies into [`TranscriptEvent`]s. The service commits utterances with
//! its own VAD and closes the socket after every committed utterance;
//! reconnecting is the session's job, not this module's.

pub mod protocol;

use crate::audio::pcm;
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError, VoiceErrorCode, from_handshake_status};
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use protocol::{InputAudioChunk, ServerMessage, WordTiming};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// How long `disconnect` waits for the socket task to finish its close handshake.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Events surfaced by a transcription connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// The service accepted the session.
    SessionStarted {
        session_id: String,
        config: serde_json::Value,
    },
    /// In-progress hypothesis; replaces any previous partial.
    Partial { text: String },
    /// Final text for one utterance (may be empty).
    Committed {
        text: String,
        language_code: Option<String>,
        words: Option<Vec<WordTiming>>,
    },
    /// Service-reported failure (`scribe_*` messages).
    Error(VoiceError),
    /// The remote closed the socket.
    Closed { code: u16, reason: String },
}

/// An open transcription connection as seen by the session.
#[async_trait]
pub trait TranscriptionLink: Send + Sync {
    /// Stream one frame; dropped silently when not connected.
    fn send_audio(&self, frame: &AudioFrame, commit: bool);
    /// Force the current utterance to commit.
    fn commit(&self);
    /// Close normally. Idempotent; no socket task remains afterwards.
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn session_id(&self) -> Option<String>;
}

/// Opens transcription connections.
#[async_trait]
pub trait TranscriptionConnector: Send + Sync {
    /// Connect and wait for the service to announce readiness.
    ///
    /// Events after readiness are delivered on `events`.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the connection cannot be established.
    async fn connect(
        &self,
        config: &VoiceConfig,
        token: Option<String>,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> Result<Box<dyn TranscriptionLink>>;
}

/// Default connector using `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl TranscriptionConnector for WebSocketConnector {
    async fn connect(
        &self,
        config: &VoiceConfig,
        token: Option<String>,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> Result<Box<dyn TranscriptionLink>> {
        let connection = TranscriptionConnection::connect(config, token.as_deref(), events).await?;
        Ok(Box::new(connection))
    }
}

enum Outbound {
    Text(String),
    Close,
}

/// A live WebSocket transcription session.
pub struct TranscriptionConnection {
    outbound: mpsc::UnboundedSender<Outbound>,
    connected: Arc<AtomicBool>,
    session_id: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn connect_failed(detail: impl std::fmt::Display) -> VoiceError {
    VoiceError::with_message(
        VoiceErrorCode::TranscriptionConnectionFailed,
        format!("transcription connection failed: {detail}"),
    )
}

impl TranscriptionConnection {
    /// Open the socket and wait for `session_started`.
    ///
    /// # Errors
    ///
    /// Fails with `transcription-connection-failed` on timeout, handshake
    /// failure or a close before readiness; handshake 401/429 and service
    /// error messages map to their specific codes.
    pub async fn connect(
        config: &VoiceConfig,
        token: Option<&str>,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> Result<Self> {
        let url = protocol::build_url(config, token)?;
        let timeout = Duration::from_millis(config.connection.connect_timeout_ms);
        debug!(host = url.host_str().unwrap_or_default(), "opening transcription socket");

        let (write, read, session_id, session_config) = tokio::time::timeout(timeout, open_session(&url))
            .await
            .map_err(|_| connect_failed("Connection timeout"))??;

        info!(%session_id, "transcription session started");

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        if events
            .send(TranscriptEvent::SessionStarted {
                session_id: session_id.clone(),
                config: session_config,
            })
            .await
            .is_err()
        {
            debug!("transcription event receiver dropped before session start");
        }

        let task = tokio::spawn(socket_loop(write, read, outbound_rx, events, Arc::clone(&connected)));

        Ok(Self {
            outbound: outbound_tx,
            connected,
            session_id: Mutex::new(Some(session_id)),
            task: Mutex::new(Some(task)),
        })
    }

    fn send_json(&self, chunk: &InputAudioChunk) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        match serde_json::to_string(chunk) {
            Ok(json) => {
                if self.outbound.send(Outbound::Text(json)).is_err() {
                    debug!("transcription socket task gone, dropping chunk");
                }
            }
            Err(e) => warn!("failed to encode audio chunk: {e}"),
        }
    }
}

#[async_trait]
impl TranscriptionLink for TranscriptionConnection {
    fn send_audio(&self, frame: &AudioFrame, commit: bool) {
        let chunk = InputAudioChunk::audio(pcm::pcm16_to_base64(&frame.samples), frame.sample_rate, commit);
        self.send_json(&chunk);
    }

    fn commit(&self) {
        self.send_json(&InputAudioChunk::commit_only());
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut id) = self.session_id.lock() {
            *id = None;
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        let Some(mut task) = task else {
            return;
        };
        let _ = self.outbound.send(Outbound::Close);
        if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
            debug!("transcription socket did not close in time, aborting");
            task.abort();
            let _ = task.await;
        }
        info!("transcription disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|id| id.clone())
    }
}

impl Drop for TranscriptionConnection {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock()
            && let Some(task) = guard.take()
        {
            task.abort();
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

/// Handshake, then wait for readiness. Messages before `session_started`
/// other than errors are ignored.
async fn open_session(url: &url::Url) -> Result<(WsWrite, WsRead, String, serde_json::Value)> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                from_handshake_status(status, &body)
            }
            other => connect_failed(other),
        })?;

    let (write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::SessionStarted { session_id, config }) => {
                    return Ok((write, read, session_id, config));
                }
                Ok(msg) => {
                    if let Some(err) = msg.as_error() {
                        return Err(err);
                    }
                }
                Err(e) => debug!("ignoring unparseable transcription message: {e}"),
            },
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = close_parts(frame.as_ref());
                let reason = if reason.is_empty() { "Unknown reason".to_owned() } else { reason };
                return Err(connect_failed(format!("closed before ready: {reason} (code: {code})")));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(connect_failed(e)),
            None => return Err(connect_failed("closed before ready")),
        }
    }
}

fn close_parts(frame: Option<&CloseFrame<'_>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.to_string()))
        .unwrap_or((1005, String::new()))
}

async fn socket_loop(
    mut write: WsWrite,
    mut read: WsRead,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::Sender<TranscriptEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = translate(&text)
                            && events.send(event).await.is_err()
                        {
                            debug!("transcription event receiver dropped");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        connected.store(false, Ordering::SeqCst);
                        let (code, reason) = close_parts(frame.as_ref());
                        debug!(code, %reason, "transcription socket closed by server");
                        let _ = events.send(TranscriptEvent::Closed { code, reason }).await;
                        break;
                    }
                    Some(Ok(_)) => {} // Binary, Ping/Pong frames handled by tungstenite.
                    // Abrupt transport loss reads as an abnormal close; the
                    // session reconnects instead of reporting it.
                    Some(Err(e)) => {
                        connected.store(false, Ordering::SeqCst);
                        let reason = e.to_string();
                        warn!("transcription socket lost: {reason}");
                        let _ = events.send(TranscriptEvent::Closed { code: 1006, reason }).await;
                        break;
                    }
                    None => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events
                            .send(TranscriptEvent::Closed { code: 1006, reason: "stream ended".into() })
                            .await;
                        break;
                    }
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(Outbound::Text(json)) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            debug!("transcription send error: {e}");
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Client disconnect".into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            debug!("transcription close error: {e}");
                        }
                        break;
                    }
                }
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

/// Map one text frame onto an event. Unknown kinds and junk yield `None`.
fn translate(text: &str) -> Option<TranscriptEvent> {
    let msg = match serde_json::from_str::<ServerMessage>(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("ignoring unparseable transcription message: {e}");
            return None;
        }
    };
    if let Some(err) = msg.as_error() {
        warn!(code = %err.code, "transcription service error: {}", err.message);
        return Some(TranscriptEvent::Error(err));
    }
    match msg {
        ServerMessage::SessionStarted { session_id, config } => {
            Some(TranscriptEvent::SessionStarted { session_id, config })
        }
        ServerMessage::PartialTranscript { text } => Some(TranscriptEvent::Partial { text }),
        ServerMessage::CommittedTranscript { text } => Some(TranscriptEvent::Committed {
            text,
            language_code: None,
            words: None,
        }),
        ServerMessage::CommittedTranscriptWithTimestamps {
            text,
            language_code,
            words,
        } => Some(TranscriptEvent::Committed {
            text,
            language_code,
            words: Some(words),
        }),
        ServerMessage::Unknown => {
            debug!("ignoring unknown transcription message kind");
            None
        }
        _ => None,
    }
}
