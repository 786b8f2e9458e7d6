//! sauti server - HTTP/WebSocket host for real-time voice conversations.

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod clients;
mod config;
mod error;
mod registry;
mod sink;
mod state;

use config::ServerConfig;
use state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "sauti-server",
    about = "Real-time voice conversation orchestrator",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sauti_server=info,sauti_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sauti server");

    let config = resolve_config(args, ServerConfig::from_env());
    info!("Sink database: {}", config.db_path.display());

    let state = AppState::new(config.clone())?;

    registry::spawn_cleanup_task(
        state.manager.clone(),
        config.cleanup_interval(),
        config.session_timeout_ms,
    );

    let app = api::create_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(state.clone()));

    info!("Server ready. Press Ctrl+C to stop.");
    server.await?;

    // Engines process their End events concurrently with connection
    // draining; a second flush catches writes enqueued after the signal.
    state.sink.flush().await;
    Ok(())
}

/// CLI flags take precedence over environment values.
fn resolve_config(args: ServerArgs, mut config: ServerConfig) -> ServerConfig {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config
}

/// Wait for a shutdown signal, then finalize every live session so their
/// ended transitions are queued on the sink before the server stops.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining sessions...");
        },
        _ = terminate => {
            info!("Received SIGTERM, draining sessions...");
        },
    }

    let ended = state.manager.end_all().await;
    if ended > 0 {
        info!("Finalized {ended} active sessions");
    }
    state.sink.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerArgs {
        ServerArgs::try_parse_from(args).expect("arguments should parse")
    }

    #[test]
    fn cli_values_override_config() {
        let config = resolve_config(
            parse(&["sauti-server", "--host", "127.0.0.1", "--port", "9000"]),
            ServerConfig::default(),
        );
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn missing_cli_values_keep_config() {
        let config = resolve_config(parse(&["sauti-server"]), ServerConfig::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
    }
}
