use super::*;
use crate::state::test_helpers::MemoryStore;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

fn counting_task(counter: &Arc<AtomicUsize>) -> impl FnOnce(u64) -> SaveTask {
    let counter = Arc::clone(counter);
    move |_epoch| {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }
}

fn snapshot(version: u64, marker: u8) -> Snapshot {
    Snapshot { version, room: StoredRoom { document: vec![marker], strokes: Vec::new() } }
}

// =============================================================================
// Debouncer
// =============================================================================

#[tokio::test]
async fn burst_of_schedules_fires_once() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut debouncer = Debouncer::new();
    for _ in 0..10 {
        debouncer.schedule(Duration::from_millis(40), counting_task(&fired));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_prevents_fire() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut debouncer = Debouncer::new();
    debouncer.schedule(Duration::from_millis(20), counting_task(&fired));
    assert!(debouncer.is_pending());
    debouncer.cancel();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!debouncer.is_pending());
}

#[test]
fn claim_rejects_superseded_epoch() {
    let mut debouncer = Debouncer::new();
    let stale = debouncer.epoch;
    debouncer.cancel();
    assert!(!debouncer.claim(stale));
    assert!(debouncer.claim(debouncer.epoch));
}

// =============================================================================
// WriteGate
// =============================================================================

#[tokio::test]
async fn gate_writes_newer_versions_only() {
    let store = MemoryStore::new();
    let gate = WriteGate::new(0);

    assert!(gate.write("r1", &*store, snapshot(2, 2)).await.unwrap());
    assert_eq!(gate.persisted(), 2);

    // An older snapshot arriving late must not overwrite the newer one.
    assert!(!gate.write("r1", &*store, snapshot(1, 1)).await.unwrap());
    assert_eq!(store.saved("r1").unwrap().document, vec![2]);
    assert_eq!(store.save_count(), 1);
}

#[tokio::test]
async fn gate_keeps_version_on_failure() {
    let store = MemoryStore::new();
    store.set_failing(true);
    let gate = WriteGate::new(0);

    assert!(gate.write("r1", &*store, snapshot(1, 1)).await.is_err());
    assert_eq!(gate.persisted(), 0);

    store.set_failing(false);
    assert!(gate.write("r1", &*store, snapshot(1, 1)).await.unwrap());
    assert_eq!(gate.persisted(), 1);
}
