use super::*;
use crate::frame::ErrorCode;
use crate::state::test_helpers::{MemoryStore, assert_channel_empty, participant, recv, test_config};
use std::time::Duration;

fn element(id: &str, content: &str) -> Element {
    Element {
        id: id.into(),
        content: content.into(),
        x: 1.0,
        y: 2.0,
        color: None,
        width: None,
        height: None,
        created_by: "u".into(),
        created_at: 1,
    }
}

fn stroke(id: &str) -> Stroke {
    Stroke {
        id: id.into(),
        points: vec![presence::Point { x: 0.0, y: 0.0 }],
        color: "#000".into(),
        width: 2.0,
        created_by: "u".into(),
        created_at: 1,
    }
}

fn registry(store: &Arc<MemoryStore>) -> Arc<RoomRegistry> {
    RoomRegistry::new(store.clone(), test_config())
}

fn elements_in(state: &[u8]) -> Vec<Element> {
    let mut doc = Document::new();
    doc.hydrate(state).unwrap();
    doc.list_elements()
}

// =============================================================================
// get_or_create / join
// =============================================================================

#[tokio::test]
async fn concurrent_joiners_share_one_hydration() {
    let store = MemoryStore::with_load_delay(Duration::from_millis(50));
    let rooms = registry(&store);

    let joins = (0..8).map(|_| {
        let rooms = Arc::clone(&rooms);
        async move {
            let (_member, info, tx, _rx) = participant(Uuid::new_v4());
            rooms.join("r1", true, info, tx).await
        }
    });
    let results = futures::future::join_all(joins).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(store.load_count(), 1);
    assert_eq!(rooms.live_rooms().await, 1);
    assert_eq!(rooms.participants("r1").await.len(), 8);
}

#[tokio::test]
async fn join_snapshot_includes_self_and_notifies_peers() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (_a, info_a, tx_a, mut rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());

    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    let snapshot = rooms.join("r1", true, info_b.clone(), tx_b).await.unwrap();

    assert_eq!(snapshot.participants.len(), 2);
    assert!(snapshot.strokes.is_empty());
    let joined = recv(&mut rx_a).await;
    assert_eq!(joined.syscall, presence::ROOM_USER_JOINED);
    assert_eq!(joined.data["user"]["userId"], info_b.user_id.to_string());
    assert_channel_empty(&mut rx_b).await;
}

#[tokio::test]
async fn same_user_rejoining_replaces_the_old_connection() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let user = Uuid::new_v4();
    let (old, info_old, tx_old, _rx_old) = participant(user);
    let (new, info_new, tx_new, _rx_new) = participant(user);

    rooms.join("r1", true, info_old, tx_old).await.unwrap();
    rooms.join("r1", true, info_new, tx_new).await.unwrap();

    assert_eq!(rooms.participants("r1").await.len(), 1);
    let err = rooms.add_element("r1", old, &element("n1", "x")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_JOINED");
    assert!(rooms.add_element("r1", new, &element("n1", "x")).await.unwrap());

    // The stale connection leaving must not remove the live one.
    rooms.leave("r1", old).await;
    assert_eq!(rooms.participants("r1").await.len(), 1);
}

#[tokio::test]
async fn corrupt_stored_snapshot_fails_join_and_clears_session() {
    let store = MemoryStore::new();
    store.put("r1", StoredRoom { document: vec![1, 2, 3], strokes: Vec::new() });
    let rooms = registry(&store);
    let (_m, info, tx, _rx) = participant(Uuid::new_v4());

    let err = rooms.join("r1", true, info, tx).await.unwrap_err();
    assert_eq!(err.error_code(), "E_STORE");
    assert_eq!(rooms.live_rooms().await, 0);
}

// =============================================================================
// mutations
// =============================================================================

#[tokio::test]
async fn mutations_reach_peers_but_not_sender() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, mut rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.join("r1", true, info_b, tx_b).await.unwrap();
    let _ = recv(&mut rx_a).await; // B joined

    assert!(rooms.add_element("r1", a, &element("n1", "hello")).await.unwrap());
    let added = recv(&mut rx_b).await;
    assert_eq!(added.syscall, presence::NODE_ADDED);
    assert_eq!(added.data["node"]["content"], "hello");
    assert!(added.data["update"].is_array());

    let patch = ElementPatch { x: Some(9.0), ..ElementPatch::default() };
    assert!(rooms.update_element("r1", a, "n1", &patch).await.unwrap());
    assert_eq!(recv(&mut rx_b).await.syscall, presence::NODE_UPDATED);

    assert!(rooms.delete_element("r1", a, "n1").await.unwrap());
    let deleted = recv(&mut rx_b).await;
    assert_eq!(deleted.syscall, presence::NODE_DELETED);
    assert_eq!(deleted.data_str("nodeId"), Some("n1"));

    assert_channel_empty(&mut rx_a).await;
}

#[tokio::test]
async fn update_of_unknown_element_is_silent() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.join("r1", true, info_b, tx_b).await.unwrap();

    let patch = ElementPatch { content: Some("x".into()), ..ElementPatch::default() };
    assert!(!rooms.update_element("r1", a, "ghost", &patch).await.unwrap());
    assert_channel_empty(&mut rx_b).await;
}

#[tokio::test]
async fn corrupt_update_is_rejected_without_relay() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.join("r1", true, info_b, tx_b).await.unwrap();

    let err = rooms.apply_update("r1", a, b"junk").await.unwrap_err();
    assert_eq!(err.error_code(), "E_CORRUPT_UPDATE");
    assert_channel_empty(&mut rx_b).await;
}

#[tokio::test]
async fn remote_update_is_relayed_as_delta() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.join("r1", true, info_b, tx_b).await.unwrap();

    let mut client = Document::with_replica(42);
    client.add_element(&element("n1", "from client"));
    let update = client.encode_delta();

    assert!(rooms.apply_update("r1", a, &update).await.unwrap());
    let relayed = recv(&mut rx_b).await;
    assert_eq!(relayed.syscall, presence::CRDT_UPDATE);

    // Applying the same bytes again changes nothing and relays nothing.
    assert!(!rooms.apply_update("r1", a, &update).await.unwrap());
    assert_channel_empty(&mut rx_b).await;
}

#[tokio::test]
async fn mutation_from_non_member_is_rejected() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (stranger, _info, _tx, _rx) = participant(Uuid::new_v4());

    let err = rooms.add_stroke("r1", stranger, stroke("s1")).await.unwrap_err();
    assert!(matches!(err, RoomError::NotJoined(_)));
    assert!(rooms.relay_cursor("r1", stranger, 1.0, 1.0, None, None).await.is_err());
}

#[tokio::test]
async fn cursor_uses_participant_defaults() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());
    let name_a = info_a.display_name.clone();
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.join("r1", true, info_b, tx_b).await.unwrap();

    rooms.relay_cursor("r1", a, 3.0, 4.0, None, Some("#abcdef")).await.unwrap();
    let cursor = recv(&mut rx_b).await;
    assert_eq!(cursor.syscall, presence::CURSOR_MOVE);
    assert_eq!(cursor.data_str("name"), Some(name_a.as_str()));
    assert_eq!(cursor.data_str("color"), Some("#abcdef"));
}

// =============================================================================
// persistence
// =============================================================================

#[tokio::test]
async fn burst_of_mutations_costs_one_write() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();

    for i in 0..10 {
        rooms.add_element("r1", a, &element(&format!("n{i}"), "x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(store.save_count(), 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.save_count(), 1);
    let saved = store.saved("r1").unwrap();
    assert_eq!(elements_in(&saved.document).len(), 10);
}

#[tokio::test]
async fn last_leave_flushes_and_evicts() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.add_element("r1", a, &element("n1", "keep me")).await.unwrap();
    rooms.add_stroke("r1", a, stroke("s1")).await.unwrap();

    rooms.leave("r1", a).await;

    assert_eq!(store.save_count(), 1);
    assert_eq!(rooms.live_rooms().await, 0);
    let saved = store.saved("r1").unwrap();
    assert_eq!(elements_in(&saved.document)[0].content, "keep me");
    assert_eq!(saved.strokes.len(), 1);

    // The cancelled debounce timer must not write again.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn rejoin_after_eviction_hydrates_a_new_generation() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    let first = rooms.get_or_create("r1", true).await.unwrap().generation();
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.add_element("r1", a, &element("n1", "persisted")).await.unwrap();
    rooms.leave("r1", a).await;

    let (_b, info_b, tx_b, _rx_b) = participant(Uuid::new_v4());
    let snapshot = rooms.join("r1", true, info_b, tx_b).await.unwrap();
    let second = rooms.get_or_create("r1", true).await.unwrap().generation();

    assert_ne!(first, second);
    assert_eq!(store.load_count(), 2);
    assert_eq!(elements_in(&snapshot.state)[0].content, "persisted");
}

#[tokio::test]
async fn join_and_mutation_racing_eviction() {
    let store = MemoryStore::with_save_delay(Duration::from_millis(100));
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    assert!(rooms.add_element("r1", a, &element("n1", "flushed")).await.unwrap());
    let old = rooms.get_or_create("r1", true).await.unwrap();

    // The last leave holds the session lock through the slow final flush.
    let leaving = tokio::spawn({
        let rooms = Arc::clone(&rooms);
        async move { rooms.leave("r1", a).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Both find the old session in the map and queue on its lock.
    let (_b, info_b, tx_b, _rx_b) = participant(Uuid::new_v4());
    let ghost = element("ghost", "lost");
    let (joined, stale) = tokio::join!(
        rooms.join("r1", true, info_b, tx_b),
        rooms.add_element("r1", a, &ghost),
    );
    leaving.await.unwrap();

    let err = stale.unwrap_err();
    assert!(matches!(err, RoomError::Closed(_)));
    assert_eq!(err.error_code(), "E_ROOM_CLOSED");

    let snapshot = joined.unwrap();
    let ids: Vec<String> = elements_in(&snapshot.state).into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["n1".to_string()]);

    let current = rooms.get_or_create("r1", true).await.unwrap();
    assert_eq!(old.room_id(), current.room_id());
    assert_ne!(old.generation(), current.generation());
    assert_eq!(store.load_count(), 2);
    assert_eq!(store.save_count(), 1);
    let saved = store.saved("r1").unwrap();
    assert!(elements_in(&saved.document).iter().all(|e| e.id != "ghost"));
}

#[tokio::test]
async fn failed_final_flush_keeps_room_and_retries() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.add_element("r1", a, &element("n1", "precious")).await.unwrap();

    store.set_failing(true);
    rooms.leave("r1", a).await;
    assert_eq!(rooms.live_rooms().await, 1);
    assert!(store.saved("r1").is_none());

    store.set_failing(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rooms.live_rooms().await, 0);
    assert_eq!(elements_in(&store.saved("r1").unwrap().document)[0].content, "precious");
}

#[tokio::test]
async fn clear_flushes_immediately() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    let (_b, info_b, tx_b, mut rx_b) = participant(Uuid::new_v4());
    rooms.join("r1", true, info_a, tx_a).await.unwrap();
    rooms.join("r1", true, info_b, tx_b).await.unwrap();
    rooms.add_stroke("r1", a, stroke("s1")).await.unwrap();
    assert_eq!(recv(&mut rx_b).await.syscall, presence::DRAWING_STROKE);

    rooms.clear_strokes("r1", a).await.unwrap();

    assert_eq!(recv(&mut rx_b).await.syscall, presence::DRAWING_CLEAR);
    assert_eq!(store.save_count(), 1);
    assert!(store.saved("r1").unwrap().strokes.is_empty());
}

#[tokio::test]
async fn ephemeral_room_never_touches_the_store() {
    let store = MemoryStore::new();
    let rooms = registry(&store);
    let (a, info_a, tx_a, _rx_a) = participant(Uuid::new_v4());
    rooms.join("r1", false, info_a, tx_a).await.unwrap();
    rooms.add_element("r1", a, &element("n1", "gone soon")).await.unwrap();
    rooms.clear_strokes("r1", a).await.unwrap();
    rooms.leave("r1", a).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.load_count(), 0);
    assert_eq!(store.save_count(), 0);
    assert_eq!(rooms.live_rooms().await, 0);
}

#[test]
fn error_codes() {
    assert_eq!(RoomError::Closed("r".into()).error_code(), "E_ROOM_CLOSED");
    assert!(RoomError::Closed("r".into()).retryable());
    assert_eq!(RoomError::NotJoined("r".into()).error_code(), "E_NOT_JOINED");
}
