//! Completed Q&A turn records.

use serde::{Deserialize, Serialize};

/// One finished user-utterance → assistant-reply cycle.
///
/// Appended to session history only on a clean `speaking → idle`
/// transition; partially-completed turns are discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub user_text: String,
    pub assistant_text: String,
    /// Opaque citation payloads passed through from the reasoning service.
    #[serde(default)]
    pub citations: Vec<serde_json::Value>,
    /// Playback length of the synthesized reply.
    pub audio_duration_ms: u64,
    /// End-to-end latency from utterance end to reply completion.
    pub latency_ms: u64,
    /// Completion wall-clock time, unix milliseconds.
    pub created_at_ms: u64,
}

pub fn new_turn_id() -> String {
    format!("turn_{}", uuid::Uuid::new_v4().simple())
}
