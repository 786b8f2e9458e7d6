//! HTTP adapters for the external transcription, reasoning, and synthesis
//! services.
//!
//! Each adapter is a thin reqwest wrapper implementing the matching
//! `sauti-core` trait. Deadlines and cancellation live in the orchestrator;
//! here a call either completes, fails with a status, or fails in
//! transport.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use sauti_core::{
    Reasoner, ReasoningReply, ReasoningRequest, ServiceError, Synthesizer, SynthesisRequest,
    Transcriber, TranscriptionResult,
};

/// Reachability probe deadline per service.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Reachability of the three external services.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServicesHealth {
    pub transcription: bool,
    pub reasoning: bool,
    pub synthesis: bool,
}

/// Shared adapters for all sessions; reqwest pools connections internally.
pub struct ServiceClients {
    client: reqwest::Client,
    transcribe_url: String,
    reason_url: String,
    synthesize_url: String,
}

impl ServiceClients {
    pub fn new(
        transcribe_url: impl Into<String>,
        reason_url: impl Into<String>,
        synthesize_url: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sauti-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ServiceError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            transcribe_url: transcribe_url.into(),
            reason_url: reason_url.into(),
            synthesize_url: synthesize_url.into(),
        })
    }

    /// Probe all three endpoints concurrently. Any HTTP answer counts as
    /// reachable; only connect failures and timeouts count against a
    /// service.
    pub async fn health(&self) -> ServicesHealth {
        let (transcription, reasoning, synthesis) = tokio::join!(
            self.probe(&self.transcribe_url),
            self.probe(&self.reason_url),
            self.probe(&self.synthesize_url),
        );
        ServicesHealth {
            transcription,
            reasoning,
            synthesis,
        }
    }

    async fn probe(&self, url: &str) -> bool {
        match self
            .client
            .get(url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(_) => true,
            Err(err) => {
                debug!("health probe failed for {url}: {err}");
                false
            }
        }
    }
}

fn map_request_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout
    } else {
        ServiceError::Transport(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ServiceError::Status {
        code: status.as_u16(),
        message: message.chars().take(200).collect(),
    })
}

#[async_trait]
impl Transcriber for ServiceClients {
    async fn transcribe(&self, audio: Bytes) -> Result<TranscriptionResult, ServiceError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("utterance.pcm")
            .mime_str("application/octet-stream")
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.transcribe_url)
            .multipart(form)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Transport(format!("bad transcription response: {e}")))?;
        Ok(TranscriptionResult {
            text: body
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            language: body
                .get("language")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl Reasoner for ServiceClients {
    async fn reason(&self, request: ReasoningRequest) -> Result<ReasoningReply, ServiceError> {
        let response = self
            .client
            .post(&self.reason_url)
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response).await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Transport(format!("bad reasoning response: {e}")))?;
        let reply = body
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let citations = body
            .get("citations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(ReasoningReply {
            response: reply,
            citations,
        })
    }
}

#[async_trait]
impl Synthesizer for ServiceClients {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Bytes, ServiceError> {
        let response = self
            .client
            .post(&self.synthesize_url)
            .json(&request)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response).await?;

        response
            .bytes()
            .await
            .map_err(|e| ServiceError::Transport(format!("bad synthesis response: {e}")))
    }
}
