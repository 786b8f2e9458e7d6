//! Registry of active sessions.
//!
//! The only cross-session structure in the process. Engines own their
//! sessions; the registry owns the handles, the per-session connected
//! flag, and the idle reaper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use sauti_core::{
    now_unix_millis, new_session_id, spawn_session, ConversationState, EngineTimings,
    Orchestrator, Session, SessionConfig, SessionEvent, SessionHandle, SessionSnapshot, VadConfig,
};

use crate::sink::{SessionRow, Sink};

/// A registered session: its engine address plus transport bookkeeping.
#[derive(Clone)]
pub struct ManagedSession {
    pub handle: SessionHandle,
    /// Whether a transport is currently attached.
    pub connected: Arc<AtomicBool>,
    /// Bumped on every transport attach; lets a stale reconnect-grace
    /// timer recognize that a newer connection came and went.
    pub attach_epoch: Arc<AtomicU64>,
}

impl ManagedSession {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, ManagedSession>>,
    orchestrator: Arc<Orchestrator>,
    sink: Arc<Sink>,
    vad: VadConfig,
    timings: EngineTimings,
}

impl SessionManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        sink: Arc<Sink>,
        vad: VadConfig,
        timings: EngineTimings,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            orchestrator,
            sink,
            vad,
            timings,
        }
    }

    /// Create a session, start its engine, and wire it into the sink.
    pub async fn create(
        &self,
        tenant_id: String,
        user_id: String,
        config: SessionConfig,
    ) -> SessionSnapshot {
        let now = now_unix_millis();
        let session = Session::new(new_session_id(), tenant_id, user_id, config, now);
        let snapshot = session.snapshot();

        let handle = spawn_session(session, self.vad, self.orchestrator.clone(), self.timings);
        self.sink.attach(
            &handle,
            SessionRow {
                session_id: snapshot.session_id.clone(),
                tenant_id: snapshot.tenant_id.clone(),
                user_id: snapshot.user_id.clone(),
                state: snapshot.state.as_str().to_string(),
                config: snapshot.config.clone(),
                metrics: snapshot.metrics.clone(),
                created_at_ms: now,
                updated_at_ms: now,
                ended_at_ms: None,
            },
        );

        let managed = ManagedSession {
            handle,
            connected: Arc::new(AtomicBool::new(false)),
            attach_epoch: Arc::new(AtomicU64::new(0)),
        };
        self.sessions
            .write()
            .await
            .insert(snapshot.session_id.clone(), managed);
        info!(session = %snapshot.session_id, "session created");
        snapshot
    }

    pub async fn get(&self, session_id: &str) -> Option<ManagedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Remove and finalize a session. False when the id is unknown.
    pub async fn delete(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(managed) => {
                managed.handle.end();
                info!(session = %session_id, "session deleted");
                true
            }
            None => false,
        }
    }

    /// Inject an explicit interrupt. False when the id is unknown.
    pub async fn interrupt(&self, session_id: &str) -> bool {
        match self.get(session_id).await {
            Some(managed) => managed.handle.send(SessionEvent::Interrupt),
            None => false,
        }
    }

    pub async fn inspect(&self, session_id: &str) -> Option<SessionSnapshot> {
        let managed = self.get(session_id).await?;
        managed.handle.inspect().await
    }

    /// Snapshot every live (non-ended) session.
    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<ManagedSession> =
            self.sessions.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for managed in handles {
            if let Some(snapshot) = managed.handle.inspect().await {
                if snapshot.state != ConversationState::Ended {
                    snapshots.push(snapshot);
                }
            }
        }
        snapshots
    }

    /// Remove sessions idle longer than `max_idle_ms` (plus any whose
    /// engine already exited). Returns the number removed.
    pub async fn cleanup(&self, max_idle_ms: u64) -> usize {
        let now = now_unix_millis();
        let entries: Vec<(String, ManagedSession)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, managed)| (id.clone(), managed.clone()))
            .collect();

        let mut expired = Vec::new();
        for (session_id, managed) in entries {
            match managed.handle.inspect().await {
                Some(snapshot) => {
                    if now.saturating_sub(snapshot.last_activity_ms) > max_idle_ms {
                        expired.push(session_id);
                    }
                }
                None => expired.push(session_id),
            }
        }

        let mut removed = 0;
        for session_id in expired {
            if self.delete(&session_id).await {
                debug!(session = %session_id, "session expired");
                removed += 1;
            }
        }
        removed
    }

    /// Finalize every registered session, leaving the registry empty.
    /// Used at shutdown so ended transitions still reach the sink.
    pub async fn end_all(&self) -> usize {
        let drained: Vec<(String, ManagedSession)> =
            self.sessions.write().await.drain().collect();
        for (session_id, managed) in &drained {
            managed.handle.end();
            debug!(session = %session_id, "session finalized at shutdown");
        }
        drained.len()
    }
}

/// Periodically reap idle sessions.
pub fn spawn_cleanup_task(
    manager: Arc<SessionManager>,
    interval: Duration,
    max_idle_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            let removed = manager.cleanup(max_idle_ms).await;
            if removed > 0 {
                info!("cleanup removed {removed} idle sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sauti_core::{
        Reasoner, ReasoningReply, ReasoningRequest, ServiceError, Synthesizer, SynthesisRequest,
        Transcriber, TranscriptionResult,
    };

    struct NullTranscriber;
    #[async_trait]
    impl Transcriber for NullTranscriber {
        async fn transcribe(&self, _audio: Bytes) -> Result<TranscriptionResult, ServiceError> {
            Ok(TranscriptionResult {
                text: String::new(),
                language: None,
            })
        }
    }

    struct NullReasoner;
    #[async_trait]
    impl Reasoner for NullReasoner {
        async fn reason(&self, _request: ReasoningRequest) -> Result<ReasoningReply, ServiceError> {
            Ok(ReasoningReply {
                response: String::new(),
                citations: Vec::new(),
            })
        }
    }

    struct NullSynthesizer;
    #[async_trait]
    impl Synthesizer for NullSynthesizer {
        async fn synthesize(&self, _request: SynthesisRequest) -> Result<Bytes, ServiceError> {
            Ok(Bytes::new())
        }
    }

    fn manager() -> SessionManager {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(NullTranscriber),
            Arc::new(NullReasoner),
            Arc::new(NullSynthesizer),
        ));
        let db = std::env::temp_dir().join(format!(
            "sauti_registry_{}.db",
            uuid::Uuid::new_v4().simple()
        ));
        let sink = Sink::initialize(db).unwrap();
        SessionManager::new(
            orchestrator,
            sink,
            VadConfig::default(),
            EngineTimings::default(),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips_config() {
        let manager = manager();
        let config = SessionConfig {
            voice: sauti_core::Voice::Nova,
            ..Default::default()
        };
        let created = manager
            .create("t1".into(), "u1".into(), config.clone())
            .await;

        let snapshot = manager.inspect(&created.session_id).await.unwrap();
        assert_eq!(snapshot.config, config);
        assert_eq!(snapshot.state, ConversationState::Idle);
        assert_eq!(snapshot.tenant_id, "t1");
    }

    #[tokio::test]
    async fn delete_twice_is_true_then_false() {
        let manager = manager();
        let created = manager
            .create("t1".into(), "u1".into(), SessionConfig::default())
            .await;
        assert!(manager.delete(&created.session_id).await);
        assert!(!manager.delete(&created.session_id).await);
        assert!(manager.get(&created.session_id).await.is_none());
    }

    #[tokio::test]
    async fn list_returns_live_sessions() {
        let manager = manager();
        let a = manager
            .create("t1".into(), "u1".into(), SessionConfig::default())
            .await;
        let b = manager
            .create("t1".into(), "u2".into(), SessionConfig::default())
            .await;

        let listed = manager.list().await;
        let ids: Vec<&str> = listed.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(listed.len(), 2);
        assert!(ids.contains(&a.session_id.as_str()));
        assert!(ids.contains(&b.session_id.as_str()));
    }

    #[tokio::test]
    async fn cleanup_reaps_only_idle_sessions() {
        let manager = manager();
        let created = manager
            .create("t1".into(), "u1".into(), SessionConfig::default())
            .await;

        assert_eq!(manager.cleanup(60_000).await, 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let removed = manager.cleanup(100).await;
        assert_eq!(removed, 1);
        assert!(manager.get(&created.session_id).await.is_none());
    }

    #[tokio::test]
    async fn interrupt_unknown_session_is_false() {
        let manager = manager();
        assert!(!manager.interrupt("sess_missing").await);
    }

    #[tokio::test]
    async fn end_all_drains_the_registry() {
        let manager = manager();
        let a = manager
            .create("t1".into(), "u1".into(), SessionConfig::default())
            .await;
        let b = manager
            .create("t1".into(), "u2".into(), SessionConfig::default())
            .await;

        assert_eq!(manager.end_all().await, 2);
        assert!(manager.get(&a.session_id).await.is_none());
        assert!(manager.get(&b.session_id).await.is_none());
        assert_eq!(manager.end_all().await, 0);
    }
}
