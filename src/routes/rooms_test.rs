use super::*;
use crate::state::test_helpers::{participant, test_app_state};
use uuid::Uuid;

#[tokio::test]
async fn presence_lists_joined_users() {
    let (state, _store) = test_app_state();
    let (_m, info, tx, _rx) = participant(Uuid::new_v4());
    let user_id = info.user_id;
    state.registry.join("r1", true, info, tx).await.unwrap();

    let Json(body) = presence(State(state), Path("r1".to_string())).await;

    assert_eq!(body.room_id, "r1");
    assert_eq!(body.users.len(), 1);
    assert_eq!(body.users[0].user_id, user_id);
}

#[tokio::test]
async fn presence_of_idle_room_is_empty() {
    let (state, _store) = test_app_state();
    let Json(body) = presence(State(state), Path("nobody-here".to_string())).await;
    assert!(body.users.is_empty());
}

#[tokio::test]
async fn healthz_counts_live_rooms() {
    let (state, _store) = test_app_state();
    let (_m, info, tx, _rx) = participant(Uuid::new_v4());
    state.registry.join("r1", true, info, tx).await.unwrap();

    let Json(body) = healthz(State(state)).await;
    assert_eq!(body.status, "ok");
    assert_eq!(body.live_rooms, 1);
}
