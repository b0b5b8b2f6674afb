//! WebSocket handler, one task per connection.
//!
//! DESIGN
//! ======
//! On upgrade the ticket is resolved to an identity, then the connection
//! enters a `select!` loop:
//! - Incoming client frames → parse into a `ClientEvent` → dispatch
//! - Frames fanned out by room peers → forward to client
//!
//! Dispatch returns the frames meant for the sender; peers are reached only
//! through the room registry, which fans out under the room lock.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → bad ticket: `error{E_AUTH_REQUIRED}` then close
//! 2. `session:connected` with connection and user ids
//! 3. `room:join` → access gate (bounded by the join timeout) → registry
//! 4. Close → leave the joined room (may evict it)

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::event::{ClientEvent, EventError};
use crate::frame::{Data, Frame, Status, now_ms};
use crate::services::access::{AccessDecision, AccessError};
use crate::services::presence::{self, ParticipantInfo};
use crate::services::room::{Member, RoomError};
use crate::services::session::{AuthError, Identity};
use crate::state::AppState;

// =============================================================================
// CONNECTION
// =============================================================================

/// Per-connection state. `room` is `Some` while Joined.
struct Connection {
    id: Uuid,
    identity: Identity,
    tx: mpsc::Sender<Frame>,
    room: Option<String>,
}

impl Connection {
    fn member(&self) -> Member {
        Member { user_id: self.identity.id, connection_id: self.id }
    }

    fn is_joined_to(&self, room_id: &str) -> bool {
        self.room.as_deref() == Some(room_id)
    }
}

/// What the socket loop should do after handling one inbound frame.
enum Flow {
    /// Send these frames to the sender and keep reading.
    Continue(Vec<Frame>),
    /// Send these frames, then close the connection.
    Close(Vec<Frame>),
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let ticket = params.get("ticket").map_or("", String::as_str);
    let identity = match state.auth.authenticate(ticket).await {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "ws ticket validation failed");
            None
        }
    };

    ws.on_upgrade(move |socket| async move {
        match identity {
            Some(identity) => run_ws(socket, state, identity).await,
            None => reject_unauthenticated(socket).await,
        }
    })
}

async fn reject_unauthenticated(mut socket: WebSocket) {
    let frame = Frame::request("session:connect", Data::new()).error_from(&AuthError::Required);
    let _ = send_frame(&mut socket, &frame).await;
    let _ = socket.send(Message::Close(None)).await;
    info!("ws: rejected unauthenticated upgrade");
}

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let connection_id = Uuid::new_v4();
    let user_id = identity.id;

    // Per-connection channel for frames fanned out by room peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_queue_capacity);
    let mut conn = Connection { id: connection_id, identity, tx: client_tx, room: None };

    if send_frame(&mut socket, &presence::connected(connection_id, user_id)).await.is_err() {
        return;
    }
    info!(%connection_id, %user_id, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let (frames, close) = match process_inbound_text(&state, &mut conn, &text).await {
                            Flow::Continue(frames) => (frames, false),
                            Flow::Close(frames) => (frames, true),
                        };
                        for frame in frames {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                        if close {
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    disconnect(&state, &mut conn).await;
    info!(%connection_id, %user_id, "ws: client disconnected");
}

/// Leave the joined room, if any. Runs once the socket loop ends.
async fn disconnect(state: &AppState, conn: &mut Connection) {
    if let Some(room_id) = conn.room.take() {
        state.registry.leave(&room_id, conn.member()).await;
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Kept apart from the socket so tests can drive dispatch directly.
async fn process_inbound_text(state: &AppState, conn: &mut Connection, text: &str) -> Flow {
    let req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(connection_id = %conn.id, error = %e, "ws: invalid inbound frame");
            let err = EventError::InvalidPayload(format!("invalid json: {e}"));
            return Flow::Continue(vec![Frame::request("unknown", Data::new()).error_from(&err)]);
        }
    };

    // Stamp the authenticated user as `from`.
    let req = req.with_from(conn.identity.id.to_string());

    if req.prefix() != "cursor" {
        info!(connection_id = %conn.id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let (room_id, event) = match ClientEvent::parse(&req) {
        Ok(parsed) => parsed,
        Err(e) => return Flow::Continue(vec![req.error_from(&e)]),
    };

    match event {
        ClientEvent::Join => handle_join(state, conn, &req, room_id).await,
        ClientEvent::Leave => {
            if conn.is_joined_to(&room_id) {
                conn.room = None;
                state.registry.leave(&room_id, conn.member()).await;
            }
            Flow::Continue(vec![])
        }
        ClientEvent::Typing | ClientEvent::StopTyping | ClientEvent::CursorMove { .. } => {
            // Presence from a connection outside the room is dropped silently.
            if conn.is_joined_to(&room_id) {
                let _ = handle_presence(state, conn.member(), &room_id, event).await;
            }
            Flow::Continue(vec![])
        }
        mutation if mutation.is_mutation() => {
            if !conn.is_joined_to(&room_id) {
                return Flow::Continue(vec![req.error_from(&RoomError::NotJoined(room_id))]);
            }
            match handle_mutation(state, conn, &room_id, mutation).await {
                Ok(()) => Flow::Continue(vec![]),
                Err(e) => {
                    warn!(connection_id = %conn.id, %room_id, error = %e, "ws: mutation rejected");
                    Flow::Continue(vec![req.error_from(&e)])
                }
            }
        }
        _ => Flow::Continue(vec![]),
    }
}

// =============================================================================
// JOIN
// =============================================================================

async fn handle_join(state: &AppState, conn: &mut Connection, req: &Frame, room_id: String) -> Flow {
    // Leave a different room first. Rejoining the same room keeps the slot
    // and the binding, so a failed rejoin still leaves on disconnect.
    if let Some(old) = conn.room.take_if(|old| *old != room_id) {
        state.registry.leave(&old, conn.member()).await;
    }

    let decision =
        match tokio::time::timeout(state.config.join_timeout, state.gate.can_join(&conn.identity, &room_id)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                error!(connection_id = %conn.id, %room_id, error = %e, "access check failed");
                return Flow::Continue(vec![req.error_from(&e)]);
            }
            Err(_) => {
                warn!(connection_id = %conn.id, %room_id, "access check timed out; closing");
                return Flow::Close(vec![req.error_from(&AccessError::Timeout)]);
            }
        };

    let durable = match decision {
        AccessDecision::Allowed { durable } => durable,
        AccessDecision::Denied { reason } => {
            info!(connection_id = %conn.id, %room_id, %reason, "join denied");
            return Flow::Continue(vec![req.error_from(&AccessError::Denied(reason))]);
        }
        AccessDecision::NotFound => return Flow::Continue(vec![req.error_from(&AccessError::NotFound(room_id))]),
    };

    let info = ParticipantInfo {
        user_id: conn.identity.id,
        connection_id: conn.id,
        display_name: conn.identity.name.clone(),
        avatar_url: conn.identity.avatar_url.clone(),
        color: conn.identity.color.clone(),
        joined_at: now_ms(),
    };

    match state.registry.join(&room_id, durable, info, conn.tx.clone()).await {
        Ok(snapshot) => {
            conn.room = Some(room_id.clone());
            Flow::Continue(vec![
                presence::users(&room_id, &snapshot.participants),
                presence::crdt_sync(&room_id, &snapshot.state),
                presence::drawing_sync(&room_id, &snapshot.strokes),
            ])
        }
        Err(e) => Flow::Continue(vec![req.error_from(&e)]),
    }
}

// =============================================================================
// PRESENCE / MUTATIONS
// =============================================================================

async fn handle_presence(state: &AppState, member: Member, room_id: &str, event: ClientEvent) -> Result<(), RoomError> {
    match event {
        ClientEvent::Typing => state.registry.relay_typing(room_id, member, true).await,
        ClientEvent::StopTyping => state.registry.relay_typing(room_id, member, false).await,
        ClientEvent::CursorMove { x, y, name, color } => {
            state
                .registry
                .relay_cursor(room_id, member, x, y, name.as_deref(), color.as_deref())
                .await
        }
        _ => Ok(()),
    }
}

async fn handle_mutation(
    state: &AppState,
    conn: &Connection,
    room_id: &str,
    event: ClientEvent,
) -> Result<(), RoomError> {
    let member = conn.member();
    match event {
        ClientEvent::NodeAdd(mut element) => {
            element.created_by = conn.identity.id.to_string();
            if element.created_at == 0 {
                element.created_at = now_ms();
            }
            state.registry.add_element(room_id, member, &element).await.map(drop)
        }
        ClientEvent::NodeUpdate { id, patch } => {
            state.registry.update_element(room_id, member, &id, &patch).await.map(drop)
        }
        ClientEvent::NodeDelete { id } => state.registry.delete_element(room_id, member, &id).await.map(drop),
        ClientEvent::CrdtUpdate(update) => state.registry.apply_update(room_id, member, &update).await.map(drop),
        ClientEvent::DrawingStroke(mut stroke) => {
            stroke.created_by = conn.identity.id.to_string();
            if stroke.created_at == 0 {
                stroke.created_at = now_ms();
            }
            state.registry.add_stroke(room_id, member, stroke).await
        }
        ClientEvent::DrawingClear => state.registry.clear_strokes(room_id, member).await,
        _ => Ok(()),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.data_str("code").unwrap_or("-");
        let message = frame.data_str("message").unwrap_or("-");
        warn!(id = %frame.id, code, message, "ws: send error frame");
    } else if frame.prefix() != "cursor" {
        info!(id = %frame.id, syscall = %frame.syscall, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
