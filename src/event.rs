//! Typed inbound events.
//!
//! DESIGN
//! ======
//! Frames arrive with a free-form `data` map. `ClientEvent::parse` turns a
//! frame into a closed set of variants at the websocket boundary, so the
//! room registry and the CRDT engine only ever see validated values.
//!
//! The room id comes from the frame's `room_id` or, failing that, from
//! `data.roomId`. Payload keys accept both the current names and the older
//! client shapes (`node` / `element`, `nodeId` / `id`, nested `update`).

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::crdt::{Element, ElementPatch};
use crate::frame::Frame;
use crate::services::presence::Stroke;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("roomId required")]
    MissingRoom,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl crate::frame::ErrorCode for EventError {
    fn error_code(&self) -> &'static str {
        "E_INVALID_PAYLOAD"
    }
}

/// Every inbound syscall a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Join,
    Leave,
    Typing,
    StopTyping,
    CursorMove { x: f64, y: f64, name: Option<String>, color: Option<String> },
    NodeAdd(Element),
    NodeUpdate { id: String, patch: ElementPatch },
    NodeDelete { id: String },
    CrdtUpdate(Vec<u8>),
    DrawingStroke(Stroke),
    DrawingClear,
}

impl ClientEvent {
    /// Parse `frame` into an event and the room it targets.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] for unknown syscalls, a missing room id, or a
    /// payload that does not match the syscall.
    pub fn parse(frame: &Frame) -> Result<(String, Self), EventError> {
        let room_id = frame
            .room_id
            .clone()
            .or_else(|| frame.data_str("roomId").map(str::to_owned))
            .filter(|id| !id.is_empty())
            .ok_or(EventError::MissingRoom)?;

        let event = match frame.syscall.as_str() {
            "room:join" => Self::Join,
            "room:leave" => Self::Leave,
            "room:typing" => Self::Typing,
            "room:stop-typing" => Self::StopTyping,
            "cursor:move" => Self::CursorMove {
                x: number(frame, "x")?,
                y: number(frame, "y")?,
                name: frame.data_str("displayName").or_else(|| frame.data_str("name")).map(str::to_owned),
                color: frame.data_str("color").map(str::to_owned),
            },
            "node:add" => {
                let element: Element = field(frame, &["node", "element"])?;
                if element.id.is_empty() || !element.is_finite() {
                    return Err(EventError::InvalidPayload("node needs an id and finite geometry".into()));
                }
                Self::NodeAdd(element)
            }
            "node:update" => {
                let body = frame.data.get("update").filter(|v| v.is_object()).cloned().unwrap_or_else(|| {
                    Value::Object(frame.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                });
                let id = body
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| EventError::InvalidPayload("id required".into()))?
                    .to_owned();
                let patch: ElementPatch = decode(body)?;
                if !patch.is_finite() {
                    return Err(EventError::InvalidPayload("non-finite geometry".into()));
                }
                Self::NodeUpdate { id, patch }
            }
            "node:delete" => {
                let id = frame
                    .data_str("nodeId")
                    .or_else(|| frame.data_str("id"))
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| EventError::InvalidPayload("nodeId required".into()))?;
                Self::NodeDelete { id: id.to_owned() }
            }
            "crdt:update" => Self::CrdtUpdate(field(frame, &["update"])?),
            "drawing:stroke" => {
                let stroke: Stroke = field(frame, &["stroke"])?;
                if !stroke.is_valid() {
                    return Err(EventError::InvalidPayload("stroke needs an id and finite points".into()));
                }
                Self::DrawingStroke(stroke)
            }
            "drawing:clear" => Self::DrawingClear,
            other => return Err(EventError::UnknownSyscall(other.to_owned())),
        };
        Ok((room_id, event))
    }

    /// Events that change room state and therefore require a joined room.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::NodeAdd(_)
                | Self::NodeUpdate { .. }
                | Self::NodeDelete { .. }
                | Self::CrdtUpdate(_)
                | Self::DrawingStroke(_)
                | Self::DrawingClear
        )
    }
}

fn number(frame: &Frame, key: &str) -> Result<f64, EventError> {
    frame
        .data
        .get(key)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .ok_or_else(|| EventError::InvalidPayload(format!("{key} must be a finite number")))
}

/// Deserialize the first present key of `keys`.
fn field<T: DeserializeOwned>(frame: &Frame, keys: &[&str]) -> Result<T, EventError> {
    let Some(value) = keys.iter().find_map(|k| frame.data.get(*k)) else {
        return Err(EventError::InvalidPayload(format!("{} required", keys[0])));
    };
    decode(value.clone())
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, EventError> {
    serde_json::from_value(value).map_err(|e| EventError::InvalidPayload(e.to_string()))
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
