//! Server configuration from environment variables.
//!
//! Every knob has a default; an unparseable value falls back with a warning
//! rather than refusing to start.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Transcription service endpoint (multipart upload).
    pub transcribe_url: String,
    /// Reasoning service endpoint (JSON).
    pub reason_url: String,
    /// Synthesis service endpoint (JSON in, audio bytes out).
    pub synthesize_url: String,
    /// SQLite file backing the durable sink.
    pub db_path: PathBuf,
    /// Base VAD energy threshold before per-session sensitivity scaling.
    pub vad_threshold: f32,
    pub vad_silence_ms: u64,
    /// Idle age after which a session is reaped.
    pub session_timeout_ms: u64,
    /// How often the reaper runs.
    pub cleanup_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            transcribe_url: "http://127.0.0.1:9001/transcribe".to_string(),
            reason_url: "http://127.0.0.1:9002/reason".to_string(),
            synthesize_url: "http://127.0.0.1:9003/synthesize".to_string(),
            db_path: PathBuf::from("sauti.db"),
            vad_threshold: 0.01,
            vad_silence_ms: 1000,
            session_timeout_ms: 3_600_000,
            cleanup_interval_ms: 300_000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("SAUTI_HOST", defaults.host),
            port: env_parsed("SAUTI_PORT", defaults.port),
            transcribe_url: env_string("SAUTI_TRANSCRIBE_URL", defaults.transcribe_url),
            reason_url: env_string("SAUTI_REASON_URL", defaults.reason_url),
            synthesize_url: env_string("SAUTI_SYNTHESIZE_URL", defaults.synthesize_url),
            db_path: PathBuf::from(env_string(
                "SAUTI_DB_PATH",
                defaults.db_path.display().to_string(),
            )),
            vad_threshold: env_parsed("SAUTI_VAD_THRESHOLD", defaults.vad_threshold),
            vad_silence_ms: env_parsed("SAUTI_VAD_SILENCE_MS", defaults.vad_silence_ms),
            session_timeout_ms: env_parsed("SAUTI_SESSION_TIMEOUT_MS", defaults.session_timeout_ms),
            cleanup_interval_ms: env_parsed(
                "SAUTI_CLEANUP_INTERVAL_MS",
                defaults.cleanup_interval_ms,
            ),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn env_string(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                warn!("Empty {key}, falling back to {default}");
                default
            } else {
                value.to_string()
            }
        }
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Invalid {key}='{raw}', falling back to {default}");
                default
            }
        },
        Err(_) => default,
    }
}
