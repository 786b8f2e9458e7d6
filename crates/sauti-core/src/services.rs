//! Contracts for the three external services a turn flows through.
//!
//! Each service is a single async operation behind a trait so the engine
//! can be driven by HTTP adapters in production and by in-process mocks in
//! tests. Cancellation and timeouts are the orchestrator's job; adapters
//! stay narrow.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::ServiceError;

/// Role of one message in the reasoning history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest {
    pub messages: Vec<ChatMessage>,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningReply {
    pub response: String,
    #[serde(default)]
    pub citations: Vec<serde_json::Value>,
}

/// Full prosody payload sent to the synthesizer.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: crate::config::Voice,
    pub tone: crate::config::Tone,
    pub energy: crate::config::Energy,
    pub pace: crate::config::Pace,
    pub prosody: bool,
    pub enable_breaths: bool,
    pub enable_ssml: bool,
}

impl SynthesisRequest {
    pub fn from_config(text: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            text: text.into(),
            voice: config.voice,
            tone: config.tone,
            energy: config.energy,
            pace: config.pace,
            prosody: config.prosody,
            enable_breaths: config.enable_breaths,
            enable_ssml: config.enable_ssml,
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance of raw PCM.
    async fn transcribe(&self, audio: Bytes) -> Result<TranscriptionResult, ServiceError>;
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Produce the assistant reply for the conversation so far.
    async fn reason(&self, request: ReasoningRequest) -> Result<ReasoningReply, ServiceError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render the reply text to PCM audio.
    async fn synthesize(&self, request: SynthesisRequest) -> Result<Bytes, ServiceError>;
}

/// A fresh opaque handle identifying one cancelable synthesis in flight.
pub fn new_stream_handle() -> String {
    format!("tts_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Energy, Pace, Tone, Voice};

    #[test]
    fn synthesis_request_copies_prosody_config() {
        let config = SessionConfig {
            voice: Voice::Nova,
            tone: Tone::Casual,
            pace: Pace::Fast,
            energy: Energy::High,
            enable_breaths: false,
            ..Default::default()
        };
        let request = SynthesisRequest::from_config("hi there", &config);
        assert_eq!(request.text, "hi there");
        assert_eq!(request.voice, Voice::Nova);
        assert_eq!(request.tone, Tone::Casual);
        assert_eq!(request.pace, Pace::Fast);
        assert_eq!(request.energy, Energy::High);
        assert!(!request.enable_breaths);
        assert!(request.enable_ssml);
    }

    #[test]
    fn chat_messages_serialize_with_lowercase_roles() {
        let value = serde_json::to_value(ChatMessage::user("hello")).unwrap();
        assert_eq!(value["role"], "user");
        let value = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(value["role"], "assistant");
    }

    #[test]
    fn stream_handles_are_unique_and_prefixed() {
        let a = new_stream_handle();
        let b = new_stream_handle();
        assert!(a.starts_with("tts_"));
        assert_ne!(a, b);
    }
}
