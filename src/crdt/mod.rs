//! CRDT document engine: one mergeable element map per room.
//!
//! ARCHITECTURE
//! ============
//! A `Document` is a map from element id to an `Entry` of per-field
//! last-writer-wins registers. Local operations stamp their writes with the
//! replica's Lamport clock; remote updates are entry states joined register
//! by register. Because the join is commutative, associative and idempotent,
//! replicas that have merged the same updates hold the same elements no
//! matter the delivery order.
//!
//! DELETES
//! =======
//! Deletes leave a tombstone that absorbs every later write for that id, so
//! a late update can never resurrect an element. Tombstones are compacted
//! after a retention window (`compact_tombstones`).

pub mod clock;
pub mod codec;
pub mod element;
pub mod entry;

use std::collections::{HashMap, HashSet};

use clock::Clock;
use entry::Entry;

pub use element::{Element, ElementPatch};

#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("corrupt update: {0}")]
    CorruptUpdate(String),
}

impl crate::frame::ErrorCode for CrdtError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::CorruptUpdate(_) => "E_CORRUPT_UPDATE",
        }
    }
}

#[derive(Debug)]
pub struct Document {
    clock: Clock,
    entries: HashMap<String, Entry>,
    /// Ids whose state changed since the last `encode_delta`.
    touched: HashSet<String>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// Empty document with a random replica id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_replica(rand::random())
    }

    #[must_use]
    pub fn with_replica(replica: u64) -> Self {
        Self { clock: Clock::new(replica), entries: HashMap::new(), touched: HashSet::new() }
    }

    #[must_use]
    pub fn replica(&self) -> u64 {
        self.clock.replica()
    }

    // =========================================================================
    // LOCAL OPERATIONS
    // =========================================================================

    /// Insert an element. An existing id is merged field by field instead of
    /// rejected; its creation metadata is kept. Returns true when the
    /// document changed.
    pub fn add_element(&mut self, element: &Element) -> bool {
        let stamp = self.clock.tick();
        let mut incoming = Entry::from_element(element, stamp);
        if let Some(existing) = self.entries.get(&element.id) {
            if existing.origin.is_some() {
                incoming.origin = None;
            }
        }
        self.merge_entry(&element.id, &incoming)
    }

    /// Merge provided fields into a visible element. Unknown or deleted ids
    /// are ignored.
    pub fn update_element(&mut self, id: &str, patch: &ElementPatch) -> bool {
        if patch.is_empty() || !self.entries.get(id).is_some_and(Entry::is_visible) {
            return false;
        }
        let stamp = self.clock.tick();
        self.merge_entry(id, &Entry::from_patch(patch, stamp))
    }

    /// Tombstone `id`. The tombstone is recorded even for ids this replica
    /// has not seen, so a late add cannot make the element appear. Returns
    /// true when a visible element was removed.
    pub fn delete_element(&mut self, id: &str, deleted_at: i64) -> bool {
        let was_visible = self.entries.get(id).is_some_and(Entry::is_visible);
        let stamp = self.clock.tick();
        self.merge_entry(id, &Entry::tombstoned(stamp, deleted_at));
        was_visible
    }

    // =========================================================================
    // MERGE
    // =========================================================================

    /// Merge an update produced by another replica. Returns true when the
    /// document changed.
    ///
    /// # Errors
    ///
    /// Returns [`CrdtError::CorruptUpdate`] without touching the document if
    /// the bytes do not decode or fail validation.
    pub fn apply_remote_update(&mut self, bytes: &[u8]) -> Result<bool, CrdtError> {
        let entries = codec::decode(bytes)?;
        let mut changed = false;
        for (id, entry) in &entries {
            if let Some(stamp) = entry.max_stamp() {
                self.clock.observe(stamp);
            }
            changed |= self.merge_entry(id, entry);
        }
        Ok(changed)
    }

    /// Merge a persisted snapshot. Hydrated state is not part of the next
    /// delta.
    ///
    /// # Errors
    ///
    /// Returns [`CrdtError::CorruptUpdate`] if the snapshot is malformed.
    pub fn hydrate(&mut self, snapshot: &[u8]) -> Result<(), CrdtError> {
        let touched_before = self.touched.clone();
        self.apply_remote_update(snapshot)?;
        self.touched = touched_before;
        Ok(())
    }

    fn merge_entry(&mut self, id: &str, incoming: &Entry) -> bool {
        let changed = match self.entries.get_mut(id) {
            Some(existing) => existing.merge(incoming),
            None => {
                let mut fresh = Entry::default();
                fresh.merge(incoming);
                self.entries.insert(id.to_owned(), fresh);
                true
            }
        };
        if changed {
            self.touched.insert(id.to_owned());
        }
        changed
    }

    // =========================================================================
    // ENCODE / READ
    // =========================================================================

    /// Full state, sufficient to rebuild the document from scratch.
    #[must_use]
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        codec::encode(&self.entries)
    }

    /// Entries changed since the previous call.
    pub fn encode_delta(&mut self) -> Vec<u8> {
        let touched = std::mem::take(&mut self.touched);
        let entries = &self.entries;
        codec::encode(touched.iter().filter_map(|id| entries.get_key_value(id)))
    }

    /// True when changes are waiting for `encode_delta`.
    #[must_use]
    pub fn has_pending_delta(&self) -> bool {
        !self.touched.is_empty()
    }

    /// Visible elements. Order is unspecified.
    #[must_use]
    pub fn list_elements(&self) -> Vec<Element> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| entry.to_element(id))
            .collect()
    }

    #[must_use]
    pub fn get_element(&self, id: &str) -> Option<Element> {
        self.entries.get(id).and_then(|e| e.to_element(id))
    }

    /// Number of visible elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.is_visible()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // GARBAGE COLLECTION
    // =========================================================================

    /// Drop tombstones older than `ttl_ms`. Returns how many were removed.
    pub fn compact_tombstones(&mut self, now_ms: i64, ttl_ms: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry
                .tombstone
                .is_none_or(|t| now_ms.saturating_sub(t.deleted_at) < ttl_ms)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            let entries = &self.entries;
            self.touched.retain(|id| entries.contains_key(id));
        }
        removed
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
