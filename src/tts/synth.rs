//! Streaming synthesis client.

use crate::config::{AudioFormat, TtsModel};
use crate::error::{Result, VoiceError, VoiceErrorCode, from_http_error, from_synthesis_status};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::debug;

/// One synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
    pub model: TtsModel,
    pub output_format: AudioFormat,
    pub latency_optimization: u8,
    pub language_code: String,
    pub api_key: String,
}

/// Turns text into encoded audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Fetch the complete encoded audio for `request`.
    ///
    /// Dropping the returned future aborts the request.
    ///
    /// # Errors
    ///
    /// Returns a classified error on HTTP or transport failure.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Bytes>;
}

#[derive(Serialize)]
struct RequestBody<'a> {
    text: &'a str,
    model_id: &'a str,
    output_format: &'a str,
    optimize_streaming_latency: u8,
    language_code: &'a str,
}

/// HTTP client for the `/v1/text-to-speech/{voice_id}/stream` endpoint.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSynthesizer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn endpoint(&self, voice_id: &str) -> String {
        format!("{}/v1/text-to-speech/{voice_id}/stream", self.base_url)
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Bytes> {
        let body = RequestBody {
            text: &request.text,
            model_id: request.model.as_str(),
            output_format: request.output_format.as_str(),
            optimize_streaming_latency: request.latency_optimization,
            language_code: &request.language_code,
        };

        let response = self
            .client
            .post(self.endpoint(&request.voice_id))
            .header("xi-api-key", &request.api_key)
            .header(reqwest::header::ACCEPT, "audio/*")
            .json(&body)
            .send()
            .await
            .map_err(|e| from_http_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(from_synthesis_status(status));
        }

        let mut audio = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| from_http_error(&e))?;
            audio.extend_from_slice(&chunk);
        }

        if audio.is_empty() {
            return Err(VoiceError::with_message(
                VoiceErrorCode::SynthesisFailed,
                "synthesis returned no audio",
            ));
        }
        debug!(bytes = audio.len(), "synthesis response received");
        Ok(audio.freeze())
    }
}
