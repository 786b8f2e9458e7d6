//! The nine-state conversation lifecycle and its legal-transition table.
//!
//! The table is the single source of truth: every state change in the
//! engine goes through [`is_legal_transition`], and an attempt outside the
//! table is a logged no-op, never a session failure.

use serde::{Deserialize, Serialize};

/// Where a session currently is in its turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    Listening,
    Transcribing,
    Interpreting,
    Answering,
    Speaking,
    Interrupted,
    Error,
    Ended,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Transcribing => "transcribing",
            ConversationState::Interpreting => "interpreting",
            ConversationState::Answering => "answering",
            ConversationState::Speaking => "speaking",
            ConversationState::Interrupted => "interrupted",
            ConversationState::Error => "error",
            ConversationState::Ended => "ended",
        }
    }

    pub const ALL: [ConversationState; 9] = [
        ConversationState::Idle,
        ConversationState::Listening,
        ConversationState::Transcribing,
        ConversationState::Interpreting,
        ConversationState::Answering,
        ConversationState::Speaking,
        ConversationState::Interrupted,
        ConversationState::Error,
        ConversationState::Ended,
    ];
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` appears in the legal-transition table.
pub fn is_legal_transition(from: ConversationState, to: ConversationState) -> bool {
    use ConversationState::*;
    matches!(
        (from, to),
        (Idle, Listening)
            | (Idle, Ended)
            | (Listening, Transcribing)
            | (Listening, Idle)
            | (Listening, Interrupted)
            | (Listening, Ended)
            | (Transcribing, Interpreting)
            | (Transcribing, Listening)
            | (Transcribing, Interrupted)
            | (Transcribing, Error)
            | (Transcribing, Ended)
            | (Interpreting, Answering)
            | (Interpreting, Interrupted)
            | (Interpreting, Error)
            | (Interpreting, Ended)
            | (Answering, Speaking)
            | (Answering, Interrupted)
            | (Answering, Error)
            | (Answering, Ended)
            | (Speaking, Listening)
            | (Speaking, Idle)
            | (Speaking, Interrupted)
            | (Speaking, Error)
            | (Speaking, Ended)
            | (Interrupted, Listening)
            | (Interrupted, Idle)
            | (Interrupted, Ended)
            | (Error, Idle)
            | (Error, Listening)
            | (Error, Ended)
    )
}

/// Immutable record of one applied state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: ConversationState,
    pub to: ConversationState,
    /// The event name that caused the change (`vad_ended`, `tts_complete`, …).
    pub event: String,
    /// Wall-clock time, unix milliseconds.
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}
