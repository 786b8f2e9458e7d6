//! sauti-core: the per-session voice conversation engine.
//!
//! A session is a long-lived actor that consumes microphone PCM, detects
//! utterance boundaries, drives transcribe → reason → synthesize with
//! cancellation, and emits observations for the transport and the durable
//! sink. The hosting service (`sauti-server`) owns transports, the session
//! registry, and the HTTP adapters for the three external services.

#![forbid(unsafe_code)]

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod orchestrator;
pub mod services;
pub mod session;
pub mod turn;
pub mod vad;

pub use audio::{AudioBuffer, AudioFrame, SAMPLE_RATE_HZ};
pub use config::{Energy, Pace, SessionConfig, Tone, Voice};
pub use engine::{
    now_unix_millis, spawn_session, EngineEvent, EngineTimings, SessionEvent, SessionHandle,
};
pub use error::{ErrorKind, FrameError, ServiceError};
pub use fsm::{is_legal_transition, ConversationState, Transition};
pub use orchestrator::{Orchestrator, StageTimeouts};
pub use services::{
    new_stream_handle, ChatMessage, Reasoner, ReasoningReply, ReasoningRequest, Role, Synthesizer,
    SynthesisRequest, Transcriber, TranscriptionResult,
};
pub use session::{new_session_id, Session, SessionMetrics, SessionSnapshot};
pub use turn::{new_turn_id, Turn};
pub use vad::{VadConfig, VadUpdate, VoiceActivityDetector};
