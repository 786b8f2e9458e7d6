//! The control surface: session lifecycle over request/response HTTP.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/sessions/:session_id",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/sessions/:session_id/interrupt",
            post(handlers::interrupt_session),
        )
        .route(
            "/sessions/:session_id/history",
            get(handlers::session_history),
        )
        .route("/services/health", get(handlers::services_health))
}
