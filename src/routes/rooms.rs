//! Read-only room endpoints.

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::services::presence::ParticipantInfo;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    pub room_id: String,
    pub users: Vec<ParticipantInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub live_rooms: usize,
}

/// Live participants of a room. Rooms with nobody connected report an
/// empty list rather than 404, since presence is transient.
pub async fn presence(State(state): State<AppState>, Path(room_id): Path<String>) -> Json<PresenceResponse> {
    let users = state.registry.participants(&room_id).await;
    Json(PresenceResponse { room_id, users })
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", live_rooms: state.registry.live_rooms().await })
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
