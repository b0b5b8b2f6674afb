//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The sync server exposes the room websocket plus two small read-only HTTP
//! endpoints: a health check and the live presence list of a room. Session
//! issuance and room CRUD live in the external HTTP service.

pub mod rooms;
pub mod ws;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/rooms/{id}/presence", get(rooms::presence))
        .route("/healthz", get(rooms::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
