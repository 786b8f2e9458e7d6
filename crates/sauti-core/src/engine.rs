//! The per-session execution context.
//!
//! Every session owns exactly one engine task. All collaborators (the
//! transport, the VAD silence deadline, orchestrator stages, the control
//! surface, recovery timers) post [`SessionEvent`]s onto its queue; the
//! task serializes them, applies FSM transitions, and broadcasts
//! [`EngineEvent`] observations that the transport and the sink consume in
//! the same order. Nothing outside this task ever holds a mutable reference
//! to the session.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::audio::{pcm_duration_ms, AudioFrame};
use crate::error::ErrorKind;
use crate::fsm::{ConversationState, Transition};
use crate::orchestrator::Orchestrator;
use crate::services::{
    new_stream_handle, ReasoningReply, ReasoningRequest, SynthesisRequest, TranscriptionResult,
};
use crate::session::{Session, SessionMetrics, SessionSnapshot};
use crate::turn::{new_turn_id, Turn};
use crate::vad::{VadConfig, VadUpdate, VoiceActivityDetector};

/// Current wall-clock time as unix milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timer windows owned by the engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineTimings {
    /// Dwell in `interrupted` before returning to `listening`.
    pub interrupt_dwell: Duration,
    /// Dwell in `error` before auto-recovering to `idle`.
    pub error_recovery: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            interrupt_dwell: Duration::from_millis(200),
            error_recovery: Duration::from_millis(2000),
        }
    }
}

/// Everything that can land on a session's event queue.
#[derive(Debug)]
pub enum SessionEvent {
    /// Inbound PCM from the transport.
    Frame(AudioFrame),
    /// Explicit interrupt (control surface or transport control frame).
    Interrupt,
    TranscriptionFinal(TranscriptionResult),
    ReasoningComplete(ReasoningReply),
    /// Begin synthesizing the staged reply. Posted by the engine to itself
    /// after entering `answering` instead of dispatching inline, so an
    /// interrupt already queued behind the reasoning reply is processed
    /// first and discards the reply before any synthesis call is issued.
    TtsStarted { stream_handle: String },
    SynthesisFinished {
        stream_handle: String,
        audio: Bytes,
    },
    StageError(ErrorKind),
    /// The VAD silence deadline fired. Stale generations are ignored.
    SilenceElapsed(u64),
    /// The interrupt dwell elapsed.
    InterruptDwellElapsed(u64),
    /// The error recovery window elapsed.
    ErrorRecoveryElapsed(u64),
    /// Snapshot request from the control surface or registry.
    Inspect(oneshot::Sender<SessionSnapshot>),
    /// Finalize the session.
    End,
}

/// Observations broadcast to the transport and the sink.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        transition: Transition,
        state: ConversationState,
        metrics: SessionMetrics,
    },
    /// The reasoning stage has started.
    Thinking { at_ms: u64 },
    /// Playback must stop now (barge-in).
    StopPlayback { at_ms: u64 },
    /// Synthesized reply audio for the client.
    Audio {
        pcm: Bytes,
        is_final: bool,
        at_ms: u64,
    },
    TurnCompleted(Turn),
    Ended { at_ms: u64 },
}

/// Cheap cloneable address of a running session engine.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
    events: broadcast::Sender<EngineEvent>,
    task: Arc<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Post an event; false when the engine has already exited.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Ask the engine for a consistent snapshot of its session.
    pub async fn inspect(&self) -> Option<SessionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if !self.send(SessionEvent::Inspect(reply_tx)) {
            return None;
        }
        reply_rx.await.ok()
    }

    pub fn end(&self) {
        let _ = self.tx.send(SessionEvent::End);
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Start the engine task for a freshly created session.
pub fn spawn_session(
    session: Session,
    vad_config: VadConfig,
    orchestrator: Arc<Orchestrator>,
    timings: EngineTimings,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(256);

    let session_id = session.session_id.clone();
    let vad = VoiceActivityDetector::new(VadConfig {
        threshold: session.config.effective_vad_threshold(vad_config.threshold),
        silence_window_ms: vad_config.silence_window_ms,
    });

    let engine = SessionEngine {
        session,
        vad,
        orchestrator,
        timings,
        self_tx: tx.clone(),
        events: events.clone(),
        cancel: CancellationToken::new(),
        stage_task: None,
        pending_turn: None,
        silence_timer: TimerSlot::default(),
        dwell_timer: TimerSlot::default(),
        recovery_timer: TimerSlot::default(),
    };

    let task = Arc::new(tokio::spawn(engine.run(rx)));
    SessionHandle {
        session_id,
        tx,
        events,
        task,
    }
}

/// A cancelable one-shot timer. Arming bumps the generation so a deadline
/// that already fired (but is still queued) is recognized as stale.
#[derive(Default)]
struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    fn arm(
        &mut self,
        duration: Duration,
        tx: mpsc::UnboundedSender<SessionEvent>,
        make_event: fn(u64) -> SessionEvent,
    ) {
        self.disarm();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(make_event(generation));
        }));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

/// A turn being assembled; promoted to a [`Turn`] only on clean completion.
struct PendingTurn {
    turn_id: String,
    started_at_ms: u64,
    user_text: String,
    assistant_text: String,
    citations: Vec<serde_json::Value>,
}

struct SessionEngine {
    session: Session,
    vad: VoiceActivityDetector,
    orchestrator: Arc<Orchestrator>,
    timings: EngineTimings,
    self_tx: mpsc::UnboundedSender<SessionEvent>,
    events: broadcast::Sender<EngineEvent>,
    /// Per-turn token; replaced when a new turn starts.
    cancel: CancellationToken,
    stage_task: Option<JoinHandle<()>>,
    pending_turn: Option<PendingTurn>,
    silence_timer: TimerSlot,
    dwell_timer: TimerSlot,
    recovery_timer: TimerSlot,
}

impl SessionEngine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        debug!(session = %self.session.session_id, "session engine started");
        while let Some(event) = rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        self.shutdown();
        debug!(session = %self.session.session_id, "session engine stopped");
    }

    /// Returns false when the engine should exit.
    fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Frame(frame) => self.on_frame(frame),
            SessionEvent::Interrupt => self.begin_interrupt("user_interrupt"),
            SessionEvent::TranscriptionFinal(result) => self.on_transcription(result),
            SessionEvent::ReasoningComplete(reply) => self.on_reasoning(reply),
            SessionEvent::TtsStarted { stream_handle } => self.on_tts_started(stream_handle),
            SessionEvent::SynthesisFinished {
                stream_handle,
                audio,
            } => self.on_synthesis(stream_handle, audio),
            SessionEvent::StageError(kind) => self.on_stage_error(kind),
            SessionEvent::SilenceElapsed(generation) => self.on_silence_elapsed(generation),
            SessionEvent::InterruptDwellElapsed(generation) => {
                if self.dwell_timer.is_current(generation)
                    && self.session.state() == ConversationState::Interrupted
                {
                    self.transition(ConversationState::Listening, "interrupt_dwell", None);
                }
            }
            SessionEvent::ErrorRecoveryElapsed(generation) => {
                if self.recovery_timer.is_current(generation)
                    && self.session.state() == ConversationState::Error
                {
                    self.transition(ConversationState::Idle, "error_recovered", None);
                }
            }
            SessionEvent::Inspect(reply_tx) => {
                let _ = reply_tx.send(self.session.snapshot());
            }
            SessionEvent::End => {
                if self.session.state() != ConversationState::Ended {
                    self.transition(ConversationState::Ended, "end", None);
                }
                let _ = self.events.send(EngineEvent::Ended {
                    at_ms: now_unix_millis(),
                });
                return false;
            }
        }
        true
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        use ConversationState::*;

        if frame.pcm.is_empty() {
            return;
        }
        let update = match self.vad.observe(&frame.pcm) {
            Ok(update) => update,
            Err(err) => {
                debug!(session = %self.session.session_id, "dropping bad frame: {err}");
                self.session.metrics.bad_frames += 1;
                return;
            }
        };

        let now = now_unix_millis();
        self.session.touch(now);

        match self.session.state() {
            Idle => {
                let dropped = self.session.audio.push(frame);
                self.session.metrics.dropped_frames += dropped as u64;
                self.transition(Listening, "user_audio", None);
            }
            Listening | Transcribing | Interrupted => {
                let dropped = self.session.audio.push(frame);
                self.session.metrics.dropped_frames += dropped as u64;
            }
            // During answering/speaking the frame only feeds barge-in
            // detection; during error/ended it is discarded.
            Answering | Speaking | Interpreting | Error | Ended => {}
        }

        match update {
            VadUpdate::SpeechStarted => {
                if matches!(self.session.state(), Answering | Speaking) {
                    self.begin_interrupt("vad_started");
                }
            }
            VadUpdate::SpeechContinuing => self.silence_timer.disarm(),
            VadUpdate::ArmSilence => {
                if matches!(self.session.state(), Listening | Transcribing | Interrupted) {
                    let window = Duration::from_millis(self.vad.config().silence_window_ms);
                    self.silence_timer
                        .arm(window, self.self_tx.clone(), SessionEvent::SilenceElapsed);
                }
            }
            VadUpdate::Quiet => {}
        }
    }

    fn on_silence_elapsed(&mut self, generation: u64) {
        if !self.silence_timer.is_current(generation) {
            return;
        }
        self.silence_timer.handle = None;
        if !self.vad.silence_elapsed() {
            return;
        }
        if self.session.state() != ConversationState::Listening {
            return;
        }

        if self.session.audio.is_empty() {
            self.transition(ConversationState::Idle, "vad_ended", None);
            return;
        }

        let audio = self.session.audio.concat();
        if self.transition(ConversationState::Transcribing, "vad_ended", None) {
            self.start_turn(audio);
        }
    }

    fn start_turn(&mut self, audio: Bytes) {
        self.cancel = CancellationToken::new();
        self.pending_turn = Some(PendingTurn {
            turn_id: new_turn_id(),
            started_at_ms: now_unix_millis(),
            user_text: String::new(),
            assistant_text: String::new(),
            citations: Vec::new(),
        });
        self.stage_task = Some(self.orchestrator.spawn_transcribe(
            audio,
            self.cancel.clone(),
            self.self_tx.clone(),
        ));
    }

    fn on_transcription(&mut self, result: TranscriptionResult) {
        if self.session.state() != ConversationState::Transcribing {
            debug!(session = %self.session.session_id, "stale transcription result dropped");
            return;
        }

        let text = result.text.trim().to_string();
        if text.is_empty() {
            self.pending_turn = None;
            self.transition(ConversationState::Listening, "transcription_final", None);
            return;
        }

        self.session.transcript_slot = Some(text.clone());
        if let Some(pending) = self.pending_turn.as_mut() {
            pending.user_text = text.clone();
        }

        if self.transition(ConversationState::Interpreting, "transcription_final", None) {
            let _ = self.events.send(EngineEvent::Thinking {
                at_ms: now_unix_millis(),
            });
            let request = ReasoningRequest {
                messages: Orchestrator::history_messages(&self.session.history, &text),
                tenant_id: self.session.tenant_id.clone(),
                user_id: self.session.user_id.clone(),
                session_id: self.session.session_id.clone(),
            };
            self.stage_task = Some(self.orchestrator.spawn_reason(
                request,
                self.cancel.clone(),
                self.self_tx.clone(),
            ));
        }
    }

    fn on_reasoning(&mut self, reply: ReasoningReply) {
        if self.session.state() != ConversationState::Interpreting {
            debug!(session = %self.session.session_id, "stale reasoning reply dropped");
            return;
        }

        if let Some(pending) = self.pending_turn.as_mut() {
            pending.assistant_text = reply.response.clone();
            pending.citations = reply.citations.clone();
        }
        self.session.response_slot = Some(reply);

        let stream_handle = new_stream_handle();
        self.session.tts_stream_handle = Some(stream_handle.clone());
        if self.transition(ConversationState::Answering, "llm_response_complete", None) {
            // Synthesis is deliberately not dispatched here: queueing the
            // start behind any pending events lets an interrupt that raced
            // the reply discard it while it is still only staged.
            let _ = self.self_tx.send(SessionEvent::TtsStarted { stream_handle });
        }
    }

    fn on_tts_started(&mut self, stream_handle: String) {
        if self.session.state() != ConversationState::Answering
            || self.session.tts_stream_handle.as_deref() != Some(stream_handle.as_str())
        {
            debug!(session = %self.session.session_id, "synthesis start dropped; reply was discarded");
            return;
        }
        let Some(reply) = self.session.response_slot.clone() else {
            debug!(session = %self.session.session_id, "no staged reply to synthesize");
            return;
        };

        if !self.transition(
            ConversationState::Speaking,
            "tts_started",
            Some(json!({ "stream_handle": stream_handle })),
        ) {
            return;
        }

        let request = SynthesisRequest::from_config(reply.response, &self.session.config);
        self.stage_task = Some(self.orchestrator.spawn_synthesize(
            request,
            stream_handle,
            self.cancel.clone(),
            self.self_tx.clone(),
        ));
    }

    fn on_synthesis(&mut self, stream_handle: String, audio: Bytes) {
        if self.session.state() != ConversationState::Speaking
            || self.session.tts_stream_handle.as_deref() != Some(stream_handle.as_str())
        {
            debug!(session = %self.session.session_id, "stale synthesis result dropped");
            return;
        }

        let now = now_unix_millis();
        let _ = self.events.send(EngineEvent::Audio {
            pcm: audio.clone(),
            is_final: true,
            at_ms: now,
        });

        let audio_duration_ms = pcm_duration_ms(audio.len());
        if self.transition(ConversationState::Idle, "tts_complete", None) {
            if let Some(pending) = self.pending_turn.take() {
                let turn = Turn {
                    turn_id: pending.turn_id,
                    user_text: pending.user_text,
                    assistant_text: pending.assistant_text,
                    citations: pending.citations,
                    audio_duration_ms,
                    latency_ms: now.saturating_sub(pending.started_at_ms),
                    created_at_ms: now,
                };
                self.session.record_turn(turn.clone());
                let _ = self.events.send(EngineEvent::TurnCompleted(turn));
            }
        }
        self.stage_task = None;
    }

    fn on_stage_error(&mut self, kind: ErrorKind) {
        use ConversationState::*;
        if !matches!(
            self.session.state(),
            Transcribing | Interpreting | Answering | Speaking
        ) {
            debug!(session = %self.session.session_id, "stale stage error dropped: {}", kind.as_str());
            return;
        }

        self.pending_turn = None;
        self.cancel.cancel();
        if let Some(task) = self.stage_task.take() {
            task.abort();
        }
        self.vad.reset();
        self.silence_timer.disarm();

        if self.transition(
            ConversationState::Error,
            "error",
            Some(json!({ "kind": kind.as_str() })),
        ) {
            self.recovery_timer.arm(
                self.timings.error_recovery,
                self.self_tx.clone(),
                SessionEvent::ErrorRecoveryElapsed,
            );
        }
    }

    /// The interrupt sub-protocol. Only a session with a turn in flight can
    /// be interrupted; a second interrupt while already `interrupted` is a
    /// no-op, so bursts collapse to one transition.
    fn begin_interrupt(&mut self, event: &str) {
        use ConversationState::*;
        let from = self.session.state();
        if !matches!(from, Transcribing | Interpreting | Answering | Speaking) {
            debug!(session = %self.session.session_id, "interrupt ignored in state {from}");
            return;
        }
        let was_audible = matches!(from, Answering | Speaking);

        if !self.transition(
            ConversationState::Interrupted,
            event,
            Some(json!({ "interrupted_from": from.as_str() })),
        ) {
            return;
        }

        // Stop the in-flight stage; cancelled calls post nothing.
        self.cancel.cancel();
        if let Some(task) = self.stage_task.take() {
            task.abort();
        }
        self.pending_turn = None;

        if was_audible {
            let _ = self.events.send(EngineEvent::StopPlayback {
                at_ms: now_unix_millis(),
            });
        }

        self.dwell_timer.arm(
            self.timings.interrupt_dwell,
            self.self_tx.clone(),
            SessionEvent::InterruptDwellElapsed,
        );
    }

    fn transition(
        &mut self,
        to: ConversationState,
        event: &str,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        match self
            .session
            .apply_transition(to, event, metadata, now_unix_millis())
        {
            Ok(transition) => {
                let _ = self.events.send(EngineEvent::StateChanged {
                    transition,
                    state: to,
                    metrics: self.session.metrics.clone(),
                });
                self.enforce_invariants();
                true
            }
            Err(invalid) => {
                warn!(
                    session = %self.session.session_id,
                    "ignoring illegal transition {} -> {} on {event}",
                    invalid.from, invalid.to
                );
                false
            }
        }
    }

    /// Last line of defense against a broken engine. A session whose state
    /// no longer agrees with its buffers cannot be trusted to keep running;
    /// it is torn down instead of limping on.
    fn enforce_invariants(&mut self) {
        let audible = matches!(
            self.session.state(),
            ConversationState::Answering | ConversationState::Speaking
        );
        if audible == self.session.tts_stream_handle.is_some() {
            return;
        }
        error!(
            session = %self.session.session_id,
            state = %self.session.state(),
            "fatal internal invariant violation: synthesis handle out of sync; ending session"
        );
        let _ = self.self_tx.send(SessionEvent::End);
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.stage_task.take() {
            task.abort();
        }
        self.silence_timer.disarm();
        self.dwell_timer.disarm();
        self.recovery_timer.disarm();
    }
}
