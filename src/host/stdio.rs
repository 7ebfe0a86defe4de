//! Stdin/stdout JSON bridge driving one [`VoiceSession`].
//!
//! Reads newline-delimited [`CommandEnvelope`] JSON, writes one
//! [`ResponseEnvelope`] per command and every session event as an
//! [`EventEnvelope`], each as a single JSON line.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::{Result, VoiceError, VoiceErrorCode};
use crate::host::contract::{CommandEnvelope, EventEnvelope, HostCommand, ResponseEnvelope};
use crate::pipeline::VoiceSession;
use crate::pipeline::messages::VoiceEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Upper bound on flushing queued events once the session is destroyed.
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn io_error(what: &str, e: std::io::Error) -> VoiceError {
    VoiceError::with_message(VoiceErrorCode::Unknown, format!("{what}: {e}"))
}

/// Run the bridge on the process's stdin and stdout.
///
/// # Errors
///
/// Returns an error if stdin or stdout fail.
pub async fn run_stdio_bridge(session: VoiceSession) -> Result<()> {
    run_bridge(session, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Run the bridge until the input closes or `shutdown` is received.
///
/// The session is destroyed before returning.
///
/// # Errors
///
/// Returns an error if reading input or writing output fails.
pub async fn run_bridge<R, W>(session: VoiceSession, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer: SharedWriter<W> = Arc::new(Mutex::new(BufWriter::new(writer)));

    let finished = CancellationToken::new();
    let mut event_handle = tokio::spawn(forward_events(
        session.subscribe(),
        Arc::clone(&writer),
        finished.clone(),
    ));

    let result = run_reader(&session, reader, &writer).await;

    session.destroy().await;
    // Teardown events are already queued; write them out, then stop.
    finished.cancel();
    if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, &mut event_handle).await.is_err() {
        tracing::warn!("event forwarder did not drain in time; aborting");
        event_handle.abort();
    }
    result
}

/// Write every session event until `finished`, then flush what is queued.
async fn forward_events<W>(
    mut events: broadcast::Receiver<VoiceEvent>,
    writer: SharedWriter<W>,
    finished: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let received = tokio::select! {
            biased;
            r = events.recv() => r,
            _ = finished.cancelled() => break,
        };
        match received {
            Ok(event) => {
                if !write_event(&writer, event).await {
                    return;
                }
            }
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
            }
            Err(RecvError::Closed) => return,
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => {
                if !write_event(&writer, event).await {
                    return;
                }
            }
            Err(TryRecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return,
        }
    }
}

/// Returns `false` once the output is unusable.
async fn write_event<W: AsyncWrite + Unpin>(writer: &SharedWriter<W>, event: VoiceEvent) -> bool {
    match serde_json::to_string(&EventEnvelope::new(event)) {
        Ok(json) => {
            let mut w = writer.lock().await;
            if let Err(e) = write_line(&mut w, &json).await {
                tracing::warn!(error = %e, "failed to write event; stopping event forwarder");
                return false;
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize event; skipping"),
    }
    true
}

async fn run_reader<R, W>(session: &VoiceSession, mut reader: R, writer: &SharedWriter<W>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| io_error("failed to read command", e))?;
        if bytes_read == 0 {
            tracing::info!("input closed (EOF); shutting down bridge");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let (response, shutdown) = match serde_json::from_str::<CommandEnvelope>(trimmed) {
            Ok(envelope) => {
                let shutdown = envelope.command == HostCommand::Shutdown;
                (dispatch(session, envelope).await, shutdown)
            }
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse command");
                (ResponseEnvelope::error(None, format!("failed to parse command: {e}")), false)
            }
        };

        let json = serde_json::to_string(&response).map_err(|e| {
            VoiceError::with_message(VoiceErrorCode::Unknown, format!("failed to serialize response: {e}"))
        })?;
        {
            let mut w = writer.lock().await;
            write_line(&mut w, &json).await?;
        }

        if shutdown {
            tracing::info!("shutdown received; stopping bridge");
            return Ok(());
        }
    }
}

/// Apply one command to the session.
pub async fn dispatch(session: &VoiceSession, envelope: CommandEnvelope) -> ResponseEnvelope {
    let id = envelope.request_id;
    tracing::debug!(command = envelope.command.as_str(), "host command");
    let outcome = match envelope.command {
        HostCommand::Start => session.start_session().await.map(drop),
        HostCommand::End => {
            session.end_session().await;
            Ok(())
        }
        HostCommand::Speak { text } => session.speak(&text).map(drop),
        HostCommand::Chunk { text, complete } => session.process_text_chunk(&text, complete).map(drop),
        HostCommand::StopSpeaking => {
            session.stop_speaking();
            Ok(())
        }
        HostCommand::Pause => {
            session.pause_listening();
            Ok(())
        }
        HostCommand::Resume => {
            session.resume_listening();
            Ok(())
        }
        HostCommand::Snapshot => return ResponseEnvelope::ok(id).with_snapshot(session.snapshot()),
        HostCommand::Devices => {
            return match session.audio_devices() {
                Ok(devices) => ResponseEnvelope::ok(id).with_devices(devices),
                Err(e) => ResponseEnvelope::error(id, e.to_string()),
            };
        }
        HostCommand::Shutdown => Ok(()),
    };
    match outcome {
        Ok(()) => ResponseEnvelope::ok(id),
        Err(e) => ResponseEnvelope::error(id, e.to_string()),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| io_error("failed to write output", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_error("failed to write newline", e))?;
    writer.flush().await.map_err(|e| io_error("failed to flush output", e))?;
    Ok(())
}
