//! Durable blob store: one snapshot row per room.
//!
//! DESIGN
//! ======
//! The registry only ever reads a room's snapshot on hydration and overwrites
//! it wholesale on flush, so the store surface is two calls keyed by room id.
//! `PgBlobStore` upserts into `room_state`; tests swap in an in-memory store.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::services::presence::Stroke;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed stored strokes: {0}")]
    Strokes(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        "E_STORE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// Everything persisted for one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredRoom {
    /// Full CRDT state as produced by `Document::encode_state_as_update`.
    pub document: Vec<u8>,
    pub strokes: Vec<Stroke>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load a room snapshot. `Ok(None)` when the room was never saved.
    async fn load(&self, room_id: &str) -> Result<Option<StoredRoom>, StoreError>;

    /// Overwrite a room snapshot.
    async fn save(&self, room_id: &str, room: &StoredRoom) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgBlobStore {
    pool: PgPool,
}

impl PgBlobStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobStore for PgBlobStore {
    async fn load(&self, room_id: &str) -> Result<Option<StoredRoom>, StoreError> {
        let row = sqlx::query("SELECT crdt_state, strokes FROM room_state WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let document: Option<Vec<u8>> = row.get("crdt_state");
        let strokes: serde_json::Value = row.get("strokes");
        Ok(Some(StoredRoom { document: document.unwrap_or_default(), strokes: serde_json::from_value(strokes)? }))
    }

    async fn save(&self, room_id: &str, room: &StoredRoom) -> Result<(), StoreError> {
        let strokes = serde_json::to_value(&room.strokes)?;
        sqlx::query(
            "INSERT INTO room_state (room_id, crdt_state, strokes, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (room_id) DO UPDATE SET
                 crdt_state = EXCLUDED.crdt_state,
                 strokes = EXCLUDED.strokes,
                 updated_at = now()",
        )
        .bind(room_id)
        .bind(&room.document)
        .bind(strokes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
