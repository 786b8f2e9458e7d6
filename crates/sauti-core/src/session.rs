//! The per-session root entity.
//!
//! A `Session` is owned exclusively by its engine task; everything else
//! sees it through snapshots. All state changes go through
//! [`Session::apply_transition`], which enforces the legal table, keeps the
//! transition chain contiguous, and maintains the counters the invariants
//! are written against.

use serde::{Deserialize, Serialize};

use crate::audio::AudioBuffer;
use crate::config::SessionConfig;
use crate::fsm::{is_legal_transition, ConversationState, Transition};
use crate::services::ReasoningReply;
use crate::turn::Turn;

/// Counters and rollups kept per session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_turns: u64,
    /// Cumulative synthesized audio playback time.
    pub total_duration_ms: u64,
    /// Rolling mean of end-to-end turn latency.
    pub avg_turn_latency_ms: f64,
    pub interrupt_count: u64,
    pub error_count: u64,
    /// Frames evicted by the audio buffer soft cap.
    pub dropped_frames: u64,
    /// Malformed inbound frames discarded.
    pub bad_frames: u64,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
}

/// Serializable view of a session for the control surface and the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub state: ConversationState,
    pub config: SessionConfig,
    pub metrics: SessionMetrics,
    pub history: Vec<Turn>,
    pub transitions: Vec<Transition>,
    pub last_activity_ms: u64,
}

/// An attempted transition outside the legal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConversationState,
    pub to: ConversationState,
}

/// The root entity for one conversation.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub config: SessionConfig,
    state: ConversationState,
    pub history: Vec<Turn>,
    pub audio: AudioBuffer,
    pub transcript_slot: Option<String>,
    pub response_slot: Option<ReasoningReply>,
    pub tts_stream_handle: Option<String>,
    pub transitions: Vec<Transition>,
    pub metrics: SessionMetrics,
    pub last_activity_ms: u64,
}

impl Session {
    pub fn new(
        session_id: String,
        tenant_id: String,
        user_id: String,
        config: SessionConfig,
        now_ms: u64,
    ) -> Self {
        Self {
            session_id,
            tenant_id,
            user_id,
            config,
            state: ConversationState::Idle,
            history: Vec::new(),
            audio: AudioBuffer::default(),
            transcript_slot: None,
            response_slot: None,
            tts_stream_handle: None,
            transitions: Vec::new(),
            metrics: SessionMetrics {
                created_at_ms: now_ms,
                ..Default::default()
            },
            last_activity_ms: now_ms,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    /// Apply a state change if the table permits it.
    ///
    /// On success the transition is appended to the state history, liveness
    /// is refreshed, counters tied to specific edges are bumped, and buffers
    /// whose invariants are scoped to the departed state are cleaned up.
    pub fn apply_transition(
        &mut self,
        to: ConversationState,
        event: &str,
        metadata: Option<serde_json::Value>,
        now_ms: u64,
    ) -> Result<Transition, InvalidTransition> {
        let from = self.state;
        if !is_legal_transition(from, to) {
            return Err(InvalidTransition { from, to });
        }

        self.state = to;
        self.last_activity_ms = now_ms;

        if from == ConversationState::Transcribing {
            self.audio.clear();
        }
        match to {
            ConversationState::Interrupted => self.metrics.interrupt_count += 1,
            ConversationState::Error => self.metrics.error_count += 1,
            ConversationState::Idle if from == ConversationState::Speaking => {
                self.metrics.total_turns += 1;
            }
            ConversationState::Ended => self.metrics.ended_at_ms = Some(now_ms),
            _ => {}
        }

        // The synthesis handle only exists inside the answering/speaking
        // window; the turn slots die with the turn.
        if !matches!(
            to,
            ConversationState::Answering | ConversationState::Speaking
        ) {
            self.tts_stream_handle = None;
        }
        if matches!(
            to,
            ConversationState::Idle
                | ConversationState::Interrupted
                | ConversationState::Error
                | ConversationState::Ended
        ) {
            self.transcript_slot = None;
            self.response_slot = None;
        }

        let transition = Transition {
            from,
            to,
            event: event.to_string(),
            at_ms: now_ms,
            metadata,
        };
        self.transitions.push(transition.clone());
        Ok(transition)
    }

    /// Record a finished turn and fold its latency into the rolling mean.
    ///
    /// Call after the `speaking → idle` transition has been applied (which
    /// already bumped `total_turns`).
    pub fn record_turn(&mut self, turn: Turn) {
        self.metrics.total_duration_ms += turn.audio_duration_ms;
        let n = self.metrics.total_turns.max(1) as f64;
        self.metrics.avg_turn_latency_ms +=
            (turn.latency_ms as f64 - self.metrics.avg_turn_latency_ms) / n;
        self.history.push(turn);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            state: self.state,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            history: self.history.clone(),
            transitions: self.transitions.clone(),
            last_activity_ms: self.last_activity_ms,
        }
    }
}

pub fn new_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4().simple())
}
