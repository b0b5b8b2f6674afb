use super::*;

#[tokio::test]
async fn new_state_has_no_live_rooms() {
    let (state, store) = test_helpers::test_app_state();
    assert_eq!(state.registry.live_rooms().await, 0);
    assert_eq!(store.load_count(), 0);
}

#[tokio::test]
async fn clones_share_the_registry() {
    let (state, _store) = test_helpers::test_app_state();
    let copy = state.clone();
    assert!(Arc::ptr_eq(&state.registry, &copy.registry));
    assert_eq!(copy.config, state.config);
}
