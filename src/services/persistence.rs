//! Persistence service: debounced room snapshots.
//!
//! DESIGN
//! ======
//! Every mutation bumps the room version and reschedules a per-room timer
//! (`Debouncer`). When the timer survives a full quiet period it snapshots
//! the room under the session lock and writes it off-lock, so a burst of
//! edits costs one write and the broadcast path never waits on storage.
//!
//! Writes for one room are serialized through a write gate that remembers
//! the last persisted version. A snapshot at or below that version is
//! skipped, so a slow older write can never land after a newer one.
//!
//! ERROR HANDLING
//! ==============
//! Store failures are logged and never reach clients. The version stays
//! ahead of the persisted one, so the room remains dirty and the caller
//! reschedules the write.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::services::store::{BlobStore, StoreError, StoredRoom};

// =============================================================================
// DEBOUNCER
// =============================================================================

pub type SaveTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cancel-and-reschedule timer. Lives inside the room state so scheduling is
/// atomic with the mutation that triggered it.
#[derive(Debug, Default)]
pub struct Debouncer {
    handle: Option<JoinHandle<()>>,
    epoch: u64,
}

impl Debouncer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort any pending timer and start a new one. `task` receives the
    /// epoch the timer was scheduled under and runs after `delay`.
    pub fn schedule(&mut self, delay: Duration, task: impl FnOnce(u64) -> SaveTask) {
        self.cancel();
        self.epoch += 1;
        let task = task(self.epoch);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        }));
    }

    /// Abort the pending timer, if any. A timer that already fired and
    /// claimed its epoch is not affected.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.epoch += 1;
    }

    /// Called by a timer when it wakes. Returns false when the timer was
    /// superseded. On success the timer owns the rest of its run and a later
    /// `schedule` will not abort it.
    pub fn claim(&mut self, epoch: u64) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.handle = None;
        true
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

// =============================================================================
// WRITE GATE
// =============================================================================

/// Room contents captured under the session lock, tagged with the version
/// they represent.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub version: u64,
    pub room: StoredRoom,
}

/// Serializes writes for one room and remembers what has been persisted.
#[derive(Debug, Default)]
pub struct WriteGate {
    persisted: AtomicU64,
    lock: Mutex<()>,
}

impl WriteGate {
    /// Gate for a room hydrated at `version`.
    #[must_use]
    pub fn new(version: u64) -> Self {
        Self { persisted: AtomicU64::new(version), lock: Mutex::new(()) }
    }

    /// Highest version known to be in the store.
    #[must_use]
    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Acquire)
    }

    /// Write `snapshot` unless something at least as new is already stored.
    /// Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns the store error; the persisted version is left unchanged.
    pub async fn write(&self, room_id: &str, store: &dyn BlobStore, snapshot: Snapshot) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        if snapshot.version <= self.persisted() {
            return Ok(false);
        }
        store.save(room_id, &snapshot.room).await?;
        self.persisted.store(snapshot.version, Ordering::Release);
        info!(%room_id, version = snapshot.version, strokes = snapshot.room.strokes.len(), "room snapshot persisted");
        Ok(true)
    }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
