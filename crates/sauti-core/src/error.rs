use thiserror::Error;

/// Turn-level failure categories surfaced to the session state machine.
///
/// Each maps to one external service stage. The engine reacts to all three
/// the same way: transition to `Error`, auto-recover to `Idle` after the
/// recovery window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TranscriptionFailed,
    ReasoningFailed,
    SynthesisFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TranscriptionFailed => "transcription_failed",
            ErrorKind::ReasoningFailed => "reasoning_failed",
            ErrorKind::SynthesisFailed => "synthesis_failed",
        }
    }
}

/// Errors from the external transcription/reasoning/synthesis adapters.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request timed out")]
    Timeout,
    #[error("service returned status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
}

/// A malformed inbound audio frame. Dropped and counted, never fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("PCM frame length {0} is not a multiple of 2")]
    OddLength(usize),
}
