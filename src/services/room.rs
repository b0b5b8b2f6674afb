//! Room service: the live session registry.
//!
//! DESIGN
//! ======
//! `RoomRegistry` maps room id to the one live `RoomSession` for that room.
//! A session owns its CRDT document, drawing strokes, participants and save
//! timer behind a single `tokio::sync::Mutex`, so every mutation and its
//! fan-out to peers happens in one critical section and peers observe
//! mutations in processing order.
//!
//! LIFECYCLE
//! =========
//! 1. First joiner inserts a `Hydrating` session while holding its lock,
//!    releases the map, loads the snapshot, marks it `Live`. Concurrent
//!    joiners wait on the session lock and share the same instance.
//! 2. Mutations bump the version and reschedule the debounced save.
//! 3. Last leave cancels the timer, flushes synchronously, marks the session
//!    `Evicted` and removes it from the map. A joiner that lands on an
//!    evicted session retries and hydrates a fresh generation.
//!
//! LOCK ORDER
//! ==========
//! Session lock before map lock. The map lock is never held while waiting
//! on a session lock that someone else may hold.
//!
//! ERROR HANDLING
//! ==============
//! A failed final flush keeps the room `Live` with its timer rescheduled, so
//! edits are retried instead of dropped with the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::crdt::{CrdtError, Document, Element, ElementPatch};
use crate::frame::{Frame, now_ms};
use crate::services::persistence::{Debouncer, Snapshot, WriteGate};
use crate::services::presence::{self, ParticipantInfo, Stroke};
use crate::services::store::{BlobStore, StoreError, StoredRoom};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room closed: {0}")]
    Closed(String),
    #[error("not joined to room: {0}")]
    NotJoined(String),
    #[error("corrupt stored snapshot for room {0}")]
    CorruptSnapshot(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed(_) => "E_ROOM_CLOSED",
            Self::NotJoined(_) => "E_NOT_JOINED",
            Self::CorruptSnapshot(_) | Self::Store(_) => "E_STORE",
            Self::Crdt(_) => "E_CORRUPT_UPDATE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Store(_))
    }
}

/// Which connection is acting. A user holds at most one slot per room; the
/// connection id tells a live slot from a replaced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub user_id: Uuid,
    pub connection_id: Uuid,
}

struct Participant {
    info: ParticipantInfo,
    tx: mpsc::Sender<Frame>,
}

/// What a joiner needs to render the room.
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub participants: Vec<ParticipantInfo>,
    /// Full CRDT state.
    pub state: Vec<u8>,
    pub strokes: Vec<Stroke>,
}

enum Phase {
    Hydrating,
    Live(Box<RoomState>),
    Evicted,
}

/// Live contents of a room. Only reachable through the session lock.
struct RoomState {
    document: Document,
    strokes: Vec<Stroke>,
    participants: HashMap<Uuid, Participant>,
    /// Bumped by every mutation. Compared against the write gate.
    version: u64,
    debouncer: Debouncer,
}

impl RoomState {
    fn new(document: Document, strokes: Vec<Stroke>) -> Self {
        Self { document, strokes, participants: HashMap::new(), version: 0, debouncer: Debouncer::new() }
    }

    fn participant_list(&self) -> Vec<ParticipantInfo> {
        let mut list: Vec<ParticipantInfo> = self.participants.values().map(|p| p.info.clone()).collect();
        list.sort_by_key(|p| p.joined_at);
        list
    }

    fn is_member(&self, member: Member) -> bool {
        self.participants
            .get(&member.user_id)
            .is_some_and(|p| p.info.connection_id == member.connection_id)
    }

    /// Send `frame` to every participant except `exclude`. Full or closed
    /// queues drop the frame.
    fn fan_out(&self, frame: &Frame, exclude: Option<Uuid>) {
        for (user_id, participant) in &self.participants {
            if exclude == Some(*user_id) {
                continue;
            }
            if participant.tx.try_send(frame.clone()).is_err() {
                debug!(%user_id, syscall = %frame.syscall, "peer queue full or closed; frame dropped");
            }
        }
    }

    fn snapshot(&mut self, tombstone_ttl_ms: i64) -> Snapshot {
        let compacted = self.document.compact_tombstones(now_ms(), tombstone_ttl_ms);
        if compacted > 0 {
            debug!(compacted, "tombstones compacted");
        }
        Snapshot {
            version: self.version,
            room: StoredRoom { document: self.document.encode_state_as_update(), strokes: self.strokes.clone() },
        }
    }
}

pub struct RoomSession {
    room_id: String,
    /// Unique per session instance.
    generation: u64,
    /// Ephemeral rooms are never hydrated or written.
    durable: bool,
    state: Arc<Mutex<Phase>>,
    gate: WriteGate,
}

impl RoomSession {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

pub struct RoomRegistry {
    /// Handed to save timers so a successful retry can evict.
    me: Weak<RoomRegistry>,
    rooms: Mutex<HashMap<String, Arc<RoomSession>>>,
    store: Arc<dyn BlobStore>,
    config: SyncConfig,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, config: SyncConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            rooms: Mutex::new(HashMap::new()),
            store,
            config,
            next_generation: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Number of sessions currently in the map.
    pub async fn live_rooms(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Current participants of a live room. Empty when the room is not live.
    pub async fn participants(&self, room_id: &str) -> Vec<ParticipantInfo> {
        let Some(session) = self.lookup(room_id).await else {
            return Vec::new();
        };
        let phase = session.state.lock().await;
        match &*phase {
            Phase::Live(state) => state.participant_list(),
            Phase::Hydrating | Phase::Evicted => Vec::new(),
        }
    }

    async fn lookup(&self, room_id: &str) -> Option<Arc<RoomSession>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    // =========================================================================
    // GET OR CREATE
    // =========================================================================

    /// Return the session for `room_id`, hydrating it from the store if no
    /// session exists. Concurrent callers for the same room share one load.
    /// The returned session may already be evicted; callers re-check the
    /// phase under its lock.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Store`] when the snapshot cannot be loaded. The
    /// half-built session is removed so the next caller retries.
    pub async fn get_or_create(&self, room_id: &str, durable: bool) -> Result<Arc<RoomSession>, RoomError> {
        let (session, hydrating) = {
            let mut rooms = self.rooms.lock().await;
            if let Some(existing) = rooms.get(room_id) {
                (Arc::clone(existing), None)
            } else {
                let session = Arc::new(RoomSession {
                    room_id: room_id.to_owned(),
                    generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                    durable,
                    state: Arc::new(Mutex::new(Phase::Hydrating)),
                    gate: WriteGate::new(0),
                });
                // Uncontended: nobody else holds this Arc yet.
                let guard = Arc::clone(&session.state).lock_owned().await;
                rooms.insert(room_id.to_owned(), Arc::clone(&session));
                (session, Some(guard))
            }
        };

        let Some(mut guard) = hydrating else {
            return Ok(session);
        };

        match self.load_state(&session).await {
            Ok(state) => {
                info!(
                    %room_id,
                    generation = session.generation,
                    replica = state.document.replica(),
                    elements = state.document.len(),
                    strokes = state.strokes.len(),
                    "room hydrated"
                );
                *guard = Phase::Live(Box::new(state));
                Ok(session)
            }
            Err(e) => {
                error!(%room_id, error = %e, "room hydration failed");
                *guard = Phase::Evicted;
                self.remove_if_current(&session).await;
                Err(e)
            }
        }
    }

    async fn load_state(&self, session: &RoomSession) -> Result<RoomState, RoomError> {
        let mut document = Document::new();
        if !session.durable {
            return Ok(RoomState::new(document, Vec::new()));
        }
        let Some(stored) = self.store.load(&session.room_id).await? else {
            return Ok(RoomState::new(document, Vec::new()));
        };
        if !stored.document.is_empty() {
            document.hydrate(&stored.document).map_err(|e| {
                warn!(room_id = %session.room_id, error = %e, "stored snapshot rejected");
                RoomError::CorruptSnapshot(session.room_id.clone())
            })?;
        }
        Ok(RoomState::new(document, stored.strokes))
    }

    async fn remove_if_current(&self, session: &Arc<RoomSession>) {
        let mut rooms = self.rooms.lock().await;
        if rooms.get(&session.room_id).is_some_and(|s| Arc::ptr_eq(s, session)) {
            rooms.remove(&session.room_id);
        }
    }

    // =========================================================================
    // JOIN / LEAVE
    // =========================================================================

    /// Register a participant and return the join snapshot. Peers get
    /// `room:user-joined` in the same critical section. A user already in
    /// the room has their previous connection replaced.
    ///
    /// # Errors
    ///
    /// Returns a store error if the room could not be hydrated.
    pub async fn join(
        &self,
        room_id: &str,
        durable: bool,
        info: ParticipantInfo,
        tx: mpsc::Sender<Frame>,
    ) -> Result<JoinSnapshot, RoomError> {
        loop {
            let session = self.get_or_create(room_id, durable).await?;
            let mut phase = session.state.lock().await;
            let Phase::Live(state) = &mut *phase else {
                // Evicted between lookup and lock; hydrate a fresh generation.
                continue;
            };

            let user_id = info.user_id;
            let replaced = state.participants.insert(user_id, Participant { info: info.clone(), tx }).is_some();
            state.fan_out(&presence::user_joined(room_id, &info), Some(user_id));

            info!(
                %room_id,
                %user_id,
                connection_id = %info.connection_id,
                replaced,
                participants = state.participants.len(),
                "participant joined room"
            );
            return Ok(JoinSnapshot {
                participants: state.participant_list(),
                state: state.document.encode_state_as_update(),
                strokes: state.strokes.clone(),
            });
        }
    }

    /// Remove a participant if `member` still owns its slot, tell the peers,
    /// and evict the room when it is empty.
    pub async fn leave(&self, room_id: &str, member: Member) {
        let Some(session) = self.lookup(room_id).await else {
            return;
        };
        let now_empty = {
            let mut phase = session.state.lock().await;
            let Phase::Live(state) = &mut *phase else {
                return;
            };
            if !state.is_member(member) {
                return;
            }
            state.participants.remove(&member.user_id);
            state.fan_out(&presence::user_left(room_id, member.user_id), None);
            info!(%room_id, user_id = %member.user_id, remaining = state.participants.len(), "participant left room");
            state.participants.is_empty()
        };
        if now_empty {
            self.evict_if_empty(&session).await;
        }
    }

    /// Final flush and disposal of an empty room. No-op if someone joined in
    /// the meantime.
    async fn evict_if_empty(&self, session: &Arc<RoomSession>) {
        let room_id = session.room_id();
        let mut phase = session.state.lock().await;
        let Phase::Live(state) = &mut *phase else {
            return;
        };
        if !state.participants.is_empty() {
            return;
        }

        state.debouncer.cancel();
        if session.durable && state.version > session.gate.persisted() {
            let snapshot = state.snapshot(self.config.tombstone_ttl_ms());
            // Held under the session lock: a joiner must see the flushed
            // snapshot, not the one before it.
            if let Err(e) = session.gate.write(room_id, self.store.as_ref(), snapshot).await {
                error!(error = %e, %room_id, "final flush failed; room retained for retry");
                self.schedule_save(session, state);
                return;
            }
        }

        *phase = Phase::Evicted;
        self.remove_if_current(session).await;
        info!(%room_id, generation = session.generation, "evicted room from memory");
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Bump the version and (re)arm the debounced save.
    fn mark_dirty(&self, session: &Arc<RoomSession>, state: &mut RoomState) {
        state.version += 1;
        self.schedule_save(session, state);
    }

    fn schedule_save(&self, session: &Arc<RoomSession>, state: &mut RoomState) {
        if !session.durable {
            return;
        }
        let registry = self.me.clone();
        let weak = Arc::downgrade(session);
        state
            .debouncer
            .schedule(self.config.save_debounce, move |epoch| Box::pin(run_scheduled_save(registry, weak, epoch)));
    }

    /// Cancel the timer and write now. Used by `drawing:clear`.
    async fn flush_now(&self, session: &Arc<RoomSession>, snapshot: Snapshot) {
        let room_id = session.room_id();
        if let Err(e) = session.gate.write(room_id, self.store.as_ref(), snapshot).await {
            error!(error = %e, %room_id, "immediate flush failed; rescheduling");
            let mut phase = session.state.lock().await;
            if let Phase::Live(state) = &mut *phase {
                self.schedule_save(session, state);
            }
        }
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Lock the session and run `f` if `member` is joined to it.
    async fn with_member<R>(
        &self,
        room_id: &str,
        member: Member,
        f: impl FnOnce(&Arc<RoomSession>, &mut RoomState) -> Result<R, RoomError>,
    ) -> Result<R, RoomError> {
        let Some(session) = self.lookup(room_id).await else {
            return Err(RoomError::NotJoined(room_id.to_owned()));
        };
        let mut phase = session.state.lock().await;
        match &mut *phase {
            Phase::Live(state) if state.is_member(member) => f(&session, state),
            Phase::Live(_) | Phase::Hydrating => Err(RoomError::NotJoined(room_id.to_owned())),
            Phase::Evicted => Err(RoomError::Closed(room_id.to_owned())),
        }
    }

    /// Insert an element and relay it. Returns whether the document changed.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] or [`RoomError::Closed`].
    pub async fn add_element(&self, room_id: &str, member: Member, element: &Element) -> Result<bool, RoomError> {
        self.with_member(room_id, member, |session, state| {
            if !state.document.add_element(element) {
                return Ok(false);
            }
            let delta = state.document.encode_delta();
            let frame = match state.document.get_element(&element.id) {
                Some(merged) => presence::node_added(room_id, &merged, &delta),
                None => presence::crdt_update(room_id, &delta),
            };
            state.fan_out(&frame, Some(member.user_id));
            self.mark_dirty(session, state);
            Ok(true)
        })
        .await
    }

    /// Merge a patch into a visible element and relay it. Unknown or deleted
    /// ids are a silent no-op.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] or [`RoomError::Closed`].
    pub async fn update_element(
        &self,
        room_id: &str,
        member: Member,
        id: &str,
        patch: &ElementPatch,
    ) -> Result<bool, RoomError> {
        self.with_member(room_id, member, |session, state| {
            if !state.document.update_element(id, patch) {
                return Ok(false);
            }
            let delta = state.document.encode_delta();
            state.fan_out(&presence::node_updated(room_id, id, patch, &delta), Some(member.user_id));
            self.mark_dirty(session, state);
            Ok(true)
        })
        .await
    }

    /// Tombstone an element and relay it. Returns whether a visible element
    /// was removed. The tombstone itself is always relayed so peers that
    /// have not seen the add yet converge.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] or [`RoomError::Closed`].
    pub async fn delete_element(&self, room_id: &str, member: Member, id: &str) -> Result<bool, RoomError> {
        self.with_member(room_id, member, |session, state| {
            let removed = state.document.delete_element(id, now_ms());
            if !state.document.has_pending_delta() {
                return Ok(removed);
            }
            let delta = state.document.encode_delta();
            let frame = if removed {
                presence::node_deleted(room_id, id, &delta)
            } else {
                presence::crdt_update(room_id, &delta)
            };
            state.fan_out(&frame, Some(member.user_id));
            self.mark_dirty(session, state);
            Ok(removed)
        })
        .await
    }

    /// Merge an update produced by a client replica and relay what changed.
    ///
    /// # Errors
    ///
    /// [`RoomError::Crdt`] for malformed bytes (document unchanged), or
    /// [`RoomError::NotJoined`] / [`RoomError::Closed`].
    pub async fn apply_update(&self, room_id: &str, member: Member, update: &[u8]) -> Result<bool, RoomError> {
        self.with_member(room_id, member, |session, state| {
            if !state.document.apply_remote_update(update)? {
                return Ok(false);
            }
            let delta = state.document.encode_delta();
            state.fan_out(&presence::crdt_update(room_id, &delta), Some(member.user_id));
            self.mark_dirty(session, state);
            Ok(true)
        })
        .await
    }

    /// Append a stroke and relay it.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] or [`RoomError::Closed`].
    pub async fn add_stroke(&self, room_id: &str, member: Member, stroke: Stroke) -> Result<(), RoomError> {
        self.with_member(room_id, member, |session, state| {
            state.fan_out(&presence::drawing_stroke(room_id, &stroke), Some(member.user_id));
            state.strokes.push(stroke);
            self.mark_dirty(session, state);
            Ok(())
        })
        .await
    }

    /// Drop every stroke, relay the clear and persist immediately.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] or [`RoomError::Closed`].
    pub async fn clear_strokes(&self, room_id: &str, member: Member) -> Result<(), RoomError> {
        let ttl_ms = self.config.tombstone_ttl_ms();
        let pending = self
            .with_member(room_id, member, |session, state| {
                state.strokes.clear();
                state.fan_out(&presence::drawing_clear(room_id), Some(member.user_id));
                state.version += 1;
                if !session.durable {
                    return Ok(None);
                }
                state.debouncer.cancel();
                Ok(Some((Arc::clone(session), state.snapshot(ttl_ms))))
            })
            .await?;

        if let Some((session, snapshot)) = pending {
            self.flush_now(&session, snapshot).await;
        }
        Ok(())
    }

    /// Relay a cursor position to peers.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] when the connection is not in the room.
    pub async fn relay_cursor(
        &self,
        room_id: &str,
        member: Member,
        x: f64,
        y: f64,
        name: Option<&str>,
        color: Option<&str>,
    ) -> Result<(), RoomError> {
        self.with_member(room_id, member, |_, state| {
            let Some(me) = state.participants.get(&member.user_id) else {
                return Ok(());
            };
            let name = name.unwrap_or(&me.info.display_name);
            let color = color.unwrap_or(&me.info.color);
            let frame = presence::cursor(room_id, member.user_id, name, color, x, y);
            state.fan_out(&frame, Some(member.user_id));
            Ok(())
        })
        .await
    }

    /// Relay a typing indicator to peers.
    ///
    /// # Errors
    ///
    /// [`RoomError::NotJoined`] when the connection is not in the room.
    pub async fn relay_typing(&self, room_id: &str, member: Member, started: bool) -> Result<(), RoomError> {
        self.with_member(room_id, member, |_, state| {
            let Some(me) = state.participants.get(&member.user_id) else {
                return Ok(());
            };
            let frame = presence::typing(room_id, &me.info, started);
            state.fan_out(&frame, Some(member.user_id));
            Ok(())
        })
        .await
    }
}

// =============================================================================
// TIMER
// =============================================================================

/// Body of a debounced save. Holds only weak references, so a timer
/// belonging to an evicted session can never write into a newer one.
async fn run_scheduled_save(registry: Weak<RoomRegistry>, session: Weak<RoomSession>, epoch: u64) {
    let (Some(registry), Some(session)) = (registry.upgrade(), session.upgrade()) else {
        return;
    };
    let room_id = session.room_id();

    let (snapshot, empty) = {
        let mut phase = session.state.lock().await;
        let Phase::Live(state) = &mut *phase else {
            return;
        };
        if !state.debouncer.claim(epoch) || state.version <= session.gate.persisted() {
            return;
        }
        (state.snapshot(registry.config.tombstone_ttl_ms()), state.participants.is_empty())
    };

    match session.gate.write(room_id, registry.store.as_ref(), snapshot).await {
        Ok(_) if empty => registry.evict_if_empty(&session).await,
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, %room_id, "debounced save failed; rescheduling");
            let mut phase = session.state.lock().await;
            if let Phase::Live(state) = &mut *phase {
                if !state.debouncer.is_pending() {
                    registry.schedule_save(&session, state);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
