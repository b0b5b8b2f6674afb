use super::*;

#[test]
fn request_sets_fields() {
    let frame = Frame::request("room:join", Data::new());
    assert_eq!(frame.syscall, "room:join");
    assert_eq!(frame.status, Status::Request);
    assert!(frame.parent_id.is_none());
    assert!(frame.room_id.is_none());
    assert!(frame.ts > 0);
}

#[test]
fn error_reply_correlates_and_keeps_room() {
    let req = Frame::request("node:add", Data::new()).with_room_id("r1");
    let err = req.error_from(&crate::event::EventError::MissingRoom);

    assert_eq!(err.parent_id, Some(req.id));
    assert_eq!(err.room_id.as_deref(), Some("r1"));
    assert_eq!(err.syscall, ERROR_SYSCALL);
    assert_eq!(err.status, Status::Error);
    assert_eq!(err.data_str(FRAME_MESSAGE), Some("roomId required"));
    assert_eq!(err.data_str(FRAME_REQUEST), Some("node:add"));
}

#[test]
fn error_from_typed() {
    #[derive(Debug, thiserror::Error)]
    #[error("not found")]
    struct NotFound;

    impl ErrorCode for NotFound {
        fn error_code(&self) -> &'static str {
            "E_NOT_FOUND"
        }
    }

    let req = Frame::request("room:join", Data::new());
    let err = req.error_from(&NotFound);

    assert_eq!(err.status, Status::Error);
    assert_eq!(err.data_str("code"), Some("E_NOT_FOUND"));
    assert_eq!(err.data_str("message"), Some("not found"));
    assert_eq!(err.data.get("retryable").and_then(serde_json::Value::as_bool), Some(false));
}

#[test]
fn prefix_extraction() {
    let frame = Frame::request("node:add", Data::new());
    assert_eq!(frame.prefix(), "node");

    let frame = Frame::request("noseparator", Data::new());
    assert_eq!(frame.prefix(), "noseparator");
}

#[test]
fn json_round_trip() {
    let original = Frame::request("room:join", Data::new())
        .with_room_id("r1")
        .with_from("test-user")
        .with_data("key", "value");

    let json = serde_json::to_string(&original).expect("serialize");
    let restored: Frame = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(restored.id, original.id);
    assert_eq!(restored.room_id.as_deref(), Some("r1"));
    assert_eq!(restored.syscall, "room:join");
    assert_eq!(restored.from.as_deref(), Some("test-user"));
    assert_eq!(restored.data_str("key"), Some("value"));
}

#[test]
fn minimal_client_frame_fills_defaults() {
    let frame: Frame = serde_json::from_str(r#"{"syscall":"room:join","room_id":"r1"}"#).expect("deserialize");
    assert_eq!(frame.status, Status::Request);
    assert!(frame.data.is_empty());
    assert_eq!(frame.room_id.as_deref(), Some("r1"));
}
