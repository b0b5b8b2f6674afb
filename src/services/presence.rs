//! Presence and drawing payloads plus the outbound notification frames.
//!
//! DESIGN
//! ======
//! Everything a peer sees about another connection (who is here, where
//! their cursor is, what they drew) is built here as a `Frame`. The room
//! registry decides who receives a frame; this module only decides what it
//! looks like. Byte payloads are JSON arrays of numbers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::{Element, ElementPatch};
use crate::frame::{Data, Frame};

// =============================================================================
// OUTBOUND SYSCALLS
// =============================================================================

pub const SESSION_CONNECTED: &str = "session:connected";
pub const ROOM_USERS: &str = "room:users";
pub const ROOM_USER_JOINED: &str = "room:user-joined";
pub const ROOM_USER_LEFT: &str = "room:user-left";
pub const ROOM_USER_TYPING: &str = "room:user-typing";
pub const ROOM_USER_STOP_TYPING: &str = "room:user-stop-typing";
pub const CURSOR_MOVE: &str = "cursor:move";
pub const NODE_ADDED: &str = "node:added";
pub const NODE_UPDATED: &str = "node:updated";
pub const NODE_DELETED: &str = "node:deleted";
pub const CRDT_SYNC: &str = "crdt:sync";
pub const CRDT_UPDATE: &str = "crdt:update";
pub const DRAWING_SYNC: &str = "drawing:sync";
pub const DRAWING_STROKE: &str = "drawing:stroke";
pub const DRAWING_CLEAR: &str = "drawing:clear";

// =============================================================================
// TYPES
// =============================================================================

/// A user currently joined to a room. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub connection_id: Uuid,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub color: String,
    /// Milliseconds since Unix epoch.
    pub joined_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One freehand stroke. Strokes are append-only and not merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: String,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: i64,
}

impl Stroke {
    /// Non-empty id and finite geometry.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && self.width.is_finite()
            && self.points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
    }
}

// =============================================================================
// FRAME BUILDERS
// =============================================================================

fn notify(syscall: &str, room_id: &str, data: Data) -> Frame {
    Frame::request(syscall, data).with_room_id(room_id)
}

fn json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

#[must_use]
pub fn connected(connection_id: Uuid, user_id: Uuid) -> Frame {
    Frame::request(SESSION_CONNECTED, Data::new())
        .with_data("connectionId", connection_id.to_string())
        .with_data("userId", user_id.to_string())
}

#[must_use]
pub fn users(room_id: &str, participants: &[ParticipantInfo]) -> Frame {
    notify(ROOM_USERS, room_id, Data::new()).with_data("users", json(&participants))
}

#[must_use]
pub fn user_joined(room_id: &str, participant: &ParticipantInfo) -> Frame {
    notify(ROOM_USER_JOINED, room_id, Data::new()).with_data("user", json(participant))
}

#[must_use]
pub fn user_left(room_id: &str, user_id: Uuid) -> Frame {
    notify(ROOM_USER_LEFT, room_id, Data::new()).with_data("userId", user_id.to_string())
}

#[must_use]
pub fn typing(room_id: &str, participant: &ParticipantInfo, started: bool) -> Frame {
    let syscall = if started { ROOM_USER_TYPING } else { ROOM_USER_STOP_TYPING };
    notify(syscall, room_id, Data::new())
        .with_data("userId", participant.user_id.to_string())
        .with_data("name", participant.display_name.clone())
}

#[must_use]
pub fn cursor(room_id: &str, user_id: Uuid, name: &str, color: &str, x: f64, y: f64) -> Frame {
    notify(CURSOR_MOVE, room_id, Data::new())
        .with_data("userId", user_id.to_string())
        .with_data("name", name)
        .with_data("color", color)
        .with_data("x", x)
        .with_data("y", y)
}

#[must_use]
pub fn node_added(room_id: &str, element: &Element, update: &[u8]) -> Frame {
    notify(NODE_ADDED, room_id, Data::new())
        .with_data("node", json(element))
        .with_data("update", json(&update))
}

#[must_use]
pub fn node_updated(room_id: &str, id: &str, patch: &ElementPatch, update: &[u8]) -> Frame {
    let mut node = json(patch);
    if let Some(map) = node.as_object_mut() {
        map.insert("id".into(), serde_json::Value::String(id.to_owned()));
    }
    notify(NODE_UPDATED, room_id, Data::new()).with_data("node", node).with_data("update", json(&update))
}

#[must_use]
pub fn node_deleted(room_id: &str, id: &str, update: &[u8]) -> Frame {
    notify(NODE_DELETED, room_id, Data::new()).with_data("nodeId", id).with_data("update", json(&update))
}

#[must_use]
pub fn crdt_sync(room_id: &str, state: &[u8]) -> Frame {
    notify(CRDT_SYNC, room_id, Data::new()).with_data("state", json(&state))
}

#[must_use]
pub fn crdt_update(room_id: &str, update: &[u8]) -> Frame {
    notify(CRDT_UPDATE, room_id, Data::new()).with_data("update", json(&update))
}

#[must_use]
pub fn drawing_sync(room_id: &str, strokes: &[Stroke]) -> Frame {
    notify(DRAWING_SYNC, room_id, Data::new()).with_data("strokes", json(&strokes))
}

#[must_use]
pub fn drawing_stroke(room_id: &str, stroke: &Stroke) -> Frame {
    notify(DRAWING_STROKE, room_id, Data::new()).with_data("stroke", json(stroke))
}

#[must_use]
pub fn drawing_clear(room_id: &str) -> Frame {
    notify(DRAWING_CLEAR, room_id, Data::new())
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
