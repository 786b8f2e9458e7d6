//! Drives one turn through transcribe → reason → synthesize.
//!
//! Each stage runs as its own spawned task tied to the turn's cancellation
//! token and posts its outcome back onto the owning session's event queue.
//! A cancelled stage posts nothing: interrupts are absorbed here, never
//! surfaced as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::engine::SessionEvent;
use crate::error::{ErrorKind, ServiceError};
use crate::services::{
    ChatMessage, Reasoner, ReasoningRequest, Synthesizer, SynthesisRequest, Transcriber,
};
use crate::turn::Turn;

/// How many prior turns are replayed to the reasoning service.
pub const HISTORY_TAIL_TURNS: usize = 5;

/// Per-stage deadlines.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub transcribe: Duration,
    pub reason: Duration,
    pub synthesize: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            transcribe: Duration::from_secs(10),
            reason: Duration::from_secs(30),
            synthesize: Duration::from_secs(30),
        }
    }
}

/// Shared turn driver; one instance serves every session.
pub struct Orchestrator {
    transcriber: Arc<dyn Transcriber>,
    reasoner: Arc<dyn Reasoner>,
    synthesizer: Arc<dyn Synthesizer>,
    timeouts: StageTimeouts,
}

impl Orchestrator {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        reasoner: Arc<dyn Reasoner>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            transcriber,
            reasoner,
            synthesizer,
            timeouts: StageTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Format the reasoning context: at most the last [`HISTORY_TAIL_TURNS`]
    /// completed turns as alternating user/assistant messages, then the new
    /// user text.
    pub fn history_messages(history: &[Turn], user_text: &str) -> Vec<ChatMessage> {
        let tail_start = history.len().saturating_sub(HISTORY_TAIL_TURNS);
        let mut messages = Vec::with_capacity((history.len() - tail_start) * 2 + 1);
        for turn in &history[tail_start..] {
            messages.push(ChatMessage::user(turn.user_text.clone()));
            messages.push(ChatMessage::assistant(turn.assistant_text.clone()));
        }
        messages.push(ChatMessage::user(user_text));
        messages
    }

    pub fn spawn_transcribe(
        &self,
        audio: Bytes,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> JoinHandle<()> {
        let transcriber = self.transcriber.clone();
        let timeout = self.timeouts.transcribe;
        tokio::spawn(async move {
            let outcome =
                run_stage(timeout, &cancel, transcriber.transcribe(audio)).await;
            match outcome {
                StageOutcome::Cancelled => {}
                StageOutcome::Ok(result) => {
                    let _ = tx.send(SessionEvent::TranscriptionFinal(result));
                }
                StageOutcome::Err(err) => {
                    warn!("transcription stage failed: {err}");
                    let _ = tx.send(SessionEvent::StageError(ErrorKind::TranscriptionFailed));
                }
            }
        })
    }

    pub fn spawn_reason(
        &self,
        request: ReasoningRequest,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> JoinHandle<()> {
        let reasoner = self.reasoner.clone();
        let timeout = self.timeouts.reason;
        tokio::spawn(async move {
            let outcome = run_stage(timeout, &cancel, reasoner.reason(request)).await;
            match outcome {
                StageOutcome::Cancelled => {}
                StageOutcome::Ok(reply) => {
                    let _ = tx.send(SessionEvent::ReasoningComplete(reply));
                }
                StageOutcome::Err(err) => {
                    warn!("reasoning stage failed: {err}");
                    let _ = tx.send(SessionEvent::StageError(ErrorKind::ReasoningFailed));
                }
            }
        })
    }

    pub fn spawn_synthesize(
        &self,
        request: SynthesisRequest,
        stream_handle: String,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> JoinHandle<()> {
        let synthesizer = self.synthesizer.clone();
        let timeout = self.timeouts.synthesize;
        tokio::spawn(async move {
            let outcome = run_stage(timeout, &cancel, synthesizer.synthesize(request)).await;
            match outcome {
                StageOutcome::Cancelled => {}
                StageOutcome::Ok(audio) => {
                    let _ = tx.send(SessionEvent::SynthesisFinished {
                        stream_handle,
                        audio,
                    });
                }
                StageOutcome::Err(err) => {
                    warn!("synthesis stage failed: {err}");
                    let _ = tx.send(SessionEvent::StageError(ErrorKind::SynthesisFailed));
                }
            }
        })
    }
}

enum StageOutcome<T> {
    Ok(T),
    Err(ServiceError),
    Cancelled,
}

/// Race one service call against its deadline and the turn token.
async fn run_stage<T>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, ServiceError>>,
) -> StageOutcome<T> {
    tokio::select! {
        _ = cancel.cancelled() => StageOutcome::Cancelled,
        result = tokio::time::timeout(timeout, call) => match result {
            Err(_) => StageOutcome::Err(ServiceError::Timeout),
            // An adapter may observe the token itself; that is still a
            // cancellation, not a failure.
            Ok(Err(ServiceError::Cancelled)) => StageOutcome::Cancelled,
            Ok(Err(err)) => StageOutcome::Err(err),
            Ok(Ok(value)) => StageOutcome::Ok(value),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::services::TranscriptionResult;
    use crate::turn::new_turn_id;
    use async_trait::async_trait;

    struct FixedTranscriber {
        text: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _audio: Bytes) -> Result<TranscriptionResult, ServiceError> {
            tokio::time::sleep(self.delay).await;
            Ok(TranscriptionResult {
                text: self.text.to_string(),
                language: Some("en".into()),
            })
        }
    }

    struct FailingReasoner;

    #[async_trait]
    impl Reasoner for FailingReasoner {
        async fn reason(
            &self,
            _request: ReasoningRequest,
        ) -> Result<crate::services::ReasoningReply, ServiceError> {
            Err(ServiceError::Status {
                code: 500,
                message: "boom".into(),
            })
        }
    }

    struct FixedSynthesizer {
        bytes: usize,
    }

    #[async_trait]
    impl Synthesizer for FixedSynthesizer {
        async fn synthesize(&self, _request: SynthesisRequest) -> Result<Bytes, ServiceError> {
            Ok(Bytes::from(vec![0u8; self.bytes]))
        }
    }

    struct EchoReasoner;

    #[async_trait]
    impl Reasoner for EchoReasoner {
        async fn reason(
            &self,
            request: ReasoningRequest,
        ) -> Result<crate::services::ReasoningReply, ServiceError> {
            Ok(crate::services::ReasoningReply {
                response: format!("echo: {}", request.messages.last().unwrap().content),
                citations: Vec::new(),
            })
        }
    }

    fn orchestrator(transcriber_delay: Duration) -> Orchestrator {
        Orchestrator::new(
            Arc::new(FixedTranscriber {
                text: "hello",
                delay: transcriber_delay,
            }),
            Arc::new(EchoReasoner),
            Arc::new(FixedSynthesizer { bytes: 24_000 }),
        )
    }

    fn request() -> ReasoningRequest {
        ReasoningRequest {
            messages: vec![ChatMessage::user("hello")],
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            session_id: "sess_test".into(),
        }
    }

    #[tokio::test]
    async fn transcribe_posts_final_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = orchestrator(Duration::ZERO);
        orchestrator
            .spawn_transcribe(Bytes::from_static(b"pcm"), CancellationToken::new(), tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            SessionEvent::TranscriptionFinal(result) => assert_eq!(result.text, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_maps_to_stage_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = orchestrator(Duration::from_secs(60)).with_timeouts(StageTimeouts {
            transcribe: Duration::from_millis(20),
            ..Default::default()
        });
        orchestrator
            .spawn_transcribe(Bytes::new(), CancellationToken::new(), tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            SessionEvent::StageError(kind) => assert_eq!(kind, ErrorKind::TranscriptionFailed),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_stage_posts_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let orchestrator = orchestrator(Duration::from_secs(60));
        let task = orchestrator.spawn_transcribe(Bytes::new(), cancel.clone(), tx);
        cancel.cancel();
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn service_failure_maps_to_kind() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            Arc::new(FixedTranscriber {
                text: "",
                delay: Duration::ZERO,
            }),
            Arc::new(FailingReasoner),
            Arc::new(FixedSynthesizer { bytes: 0 }),
        );
        orchestrator
            .spawn_reason(request(), CancellationToken::new(), tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            SessionEvent::StageError(kind) => assert_eq!(kind, ErrorKind::ReasoningFailed),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn synthesize_carries_its_handle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = orchestrator(Duration::ZERO);
        let request = SynthesisRequest::from_config("hi there", &SessionConfig::default());
        orchestrator
            .spawn_synthesize(request, "tts_42".into(), CancellationToken::new(), tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            SessionEvent::SynthesisFinished {
                stream_handle,
                audio,
            } => {
                assert_eq!(stream_handle, "tts_42");
                assert_eq!(audio.len(), 24_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn history_tail_caps_at_five_turns() {
        let history: Vec<Turn> = (0..8)
            .map(|i| Turn {
                turn_id: new_turn_id(),
                user_text: format!("q{i}"),
                assistant_text: format!("a{i}"),
                citations: Vec::new(),
                audio_duration_ms: 0,
                latency_ms: 0,
                created_at_ms: i,
            })
            .collect();

        let messages = Orchestrator::history_messages(&history, "q8");
        // 5 turns * 2 messages + the new user text.
        assert_eq!(messages.len(), 11);
        assert_eq!(messages[0].content, "q3");
        assert_eq!(messages[1].content, "a3");
        assert_eq!(messages.last().unwrap().content, "q8");
        assert!(matches!(messages.last().unwrap().role, crate::services::Role::User));
    }

    #[test]
    fn empty_history_is_just_the_user_text() {
        let messages = Orchestrator::history_messages(&[], "hello");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }
}
