//! Durable, best-effort persistence of sessions, turns, and transitions.
//!
//! Backed by SQLite. Writes are enqueued onto an unbounded channel and
//! applied by a single writer task, so the session engines never block on
//! storage and per-session write order matches event order. A failed write
//! is logged and dropped; the sink never propagates errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rusqlite::{params, Connection};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{debug, warn};

use sauti_core::{
    EngineEvent, SessionConfig, SessionHandle, SessionMetrics, Transition, Turn,
};

/// Current persisted shape of one session.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub state: String,
    pub config: SessionConfig,
    pub metrics: SessionMetrics,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub ended_at_ms: Option<u64>,
}

enum SinkOp {
    UpsertSession(SessionRow),
    InsertTurn { session_id: String, turn: Turn },
    InsertTransition {
        session_id: String,
        transition: Transition,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task. Cheap to clone via `Arc`.
pub struct Sink {
    tx: mpsc::UnboundedSender<SinkOp>,
}

impl Sink {
    /// Create the schema and start the writer task.
    pub fn initialize(db_path: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create sink directory: {}", parent.display())
                })?;
            }
        }

        let conn = open_connection(&db_path)
            .with_context(|| format!("Failed to open sink database: {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                state TEXT NOT NULL,
                config TEXT NOT NULL,
                metrics TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                ended_at INTEGER NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                turn_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_text TEXT NOT NULL,
                assistant_text TEXT NOT NULL,
                citations TEXT NOT NULL,
                audio_duration_ms INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id)
            );

            CREATE TABLE IF NOT EXISTS transitions (
                serial INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                event TEXT NOT NULL,
                metadata TEXT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_turns_session_created_at
                ON turns(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_transitions_session_serial
                ON transitions(session_id, serial);
            "#,
        )
        .context("Failed to initialize sink schema")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(db_path, rx));
        Ok(Arc::new(Self { tx }))
    }

    pub fn record_session(&self, row: SessionRow) {
        let _ = self.tx.send(SinkOp::UpsertSession(row));
    }

    pub fn record_turn(&self, session_id: impl Into<String>, turn: Turn) {
        let _ = self.tx.send(SinkOp::InsertTurn {
            session_id: session_id.into(),
            turn,
        });
    }

    pub fn record_transition(&self, session_id: impl Into<String>, transition: Transition) {
        let _ = self.tx.send(SinkOp::InsertTransition {
            session_id: session_id.into(),
            transition,
        });
    }

    /// Wait until every previously enqueued write has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Mirror one session's engine observations into the store until the
    /// session ends.
    pub fn attach(self: &Arc<Self>, handle: &SessionHandle, mut row: SessionRow) {
        let sink = Arc::clone(self);
        let mut events = handle.subscribe();
        sink.record_session(row.clone());

        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match events.recv().await {
                    Ok(EngineEvent::StateChanged {
                        transition,
                        state,
                        metrics,
                    }) => {
                        row.state = state.as_str().to_string();
                        row.updated_at_ms = transition.at_ms;
                        row.ended_at_ms = metrics.ended_at_ms;
                        row.metrics = metrics;
                        sink.record_transition(row.session_id.clone(), transition);
                        sink.record_session(row.clone());
                    }
                    Ok(EngineEvent::TurnCompleted(turn)) => {
                        sink.record_turn(row.session_id.clone(), turn);
                    }
                    Ok(EngineEvent::Ended { .. }) => break,
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session = %row.session_id, "sink forwarder lagged, skipped {skipped} events");
                    }
                }
            }
            debug!(session = %row.session_id, "sink forwarder stopped");
        });
    }
}

async fn writer_loop(db_path: PathBuf, mut rx: mpsc::UnboundedReceiver<SinkOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            SinkOp::Flush(done) => {
                let _ = done.send(());
            }
            op => {
                let path = db_path.clone();
                match task::spawn_blocking(move || apply(&path, op)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!("sink write failed: {err:#}"),
                    Err(err) => warn!("sink writer task failed: {err}"),
                }
            }
        }
    }
}

fn apply(db_path: &Path, op: SinkOp) -> anyhow::Result<()> {
    let conn = open_connection(db_path)?;
    match op {
        SinkOp::UpsertSession(row) => {
            conn.execute(
                r#"
                INSERT INTO sessions
                    (session_id, tenant_id, user_id, state, config, metrics,
                     created_at, updated_at, ended_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(session_id) DO UPDATE SET
                    state = excluded.state,
                    metrics = excluded.metrics,
                    updated_at = excluded.updated_at,
                    ended_at = excluded.ended_at
                "#,
                params![
                    row.session_id,
                    row.tenant_id,
                    row.user_id,
                    row.state,
                    serde_json::to_string(&row.config)?,
                    serde_json::to_string(&row.metrics)?,
                    row.created_at_ms as i64,
                    row.updated_at_ms as i64,
                    row.ended_at_ms.map(|v| v as i64),
                ],
            )?;
        }
        SinkOp::InsertTurn { session_id, turn } => {
            conn.execute(
                r#"
                INSERT OR IGNORE INTO turns
                    (turn_id, session_id, user_text, assistant_text, citations,
                     audio_duration_ms, latency_ms, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    turn.turn_id,
                    session_id,
                    turn.user_text,
                    turn.assistant_text,
                    serde_json::to_string(&turn.citations)?,
                    turn.audio_duration_ms as i64,
                    turn.latency_ms as i64,
                    turn.created_at_ms as i64,
                ],
            )?;
        }
        SinkOp::InsertTransition {
            session_id,
            transition,
        } => {
            let metadata = transition
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                r#"
                INSERT INTO transitions
                    (session_id, from_state, to_state, event, metadata, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    session_id,
                    transition.from.as_str(),
                    transition.to.as_str(),
                    transition.event,
                    metadata,
                    transition.at_ms as i64,
                ],
            )?;
        }
        SinkOp::Flush(_) => unreachable!("flush handled in writer loop"),
    }
    Ok(())
}

fn open_connection(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}
