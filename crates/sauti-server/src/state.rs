//! Shared application state.

use std::sync::Arc;

use sauti_core::{EngineTimings, Orchestrator, VadConfig};

use crate::clients::ServiceClients;
use crate::config::ServerConfig;
use crate::registry::SessionManager;
use crate::sink::Sink;

/// Cloned into every handler; everything inside is `Arc`-shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub clients: Arc<ServiceClients>,
    pub manager: Arc<SessionManager>,
    pub sink: Arc<Sink>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let clients = Arc::new(ServiceClients::new(
            config.transcribe_url.clone(),
            config.reason_url.clone(),
            config.synthesize_url.clone(),
        )?);
        let sink = Sink::initialize(&config.db_path)?;

        let orchestrator = Arc::new(Orchestrator::new(
            clients.clone(),
            clients.clone(),
            clients.clone(),
        ));
        let manager = Arc::new(SessionManager::new(
            orchestrator,
            sink.clone(),
            VadConfig {
                threshold: config.vad_threshold,
                silence_window_ms: config.vad_silence_ms,
            },
            EngineTimings::default(),
        ));

        Ok(Self {
            config: Arc::new(config),
            clients,
            manager,
            sink,
        })
    }
}
