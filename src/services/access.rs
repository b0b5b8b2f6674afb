//! Access control gate: may this identity join this room?
//!
//! DESIGN
//! ======
//! Room metadata (visibility, persistence mode, membership) is owned by the
//! external CRUD service. The gate only reads it. `PUBLIC` and `UNLISTED`
//! rooms admit any authenticated user; `PRIVATE` rooms admit the creator and
//! listed participants. Inactive rooms look the same as missing ones.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::services::session::Identity;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("access denied: {0}")]
    Denied(String),
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("access check timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for AccessError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Denied(_) => "E_ACCESS_DENIED",
            Self::NotFound(_) => "E_ROOM_NOT_FOUND",
            Self::Timeout => "E_JOIN_TIMEOUT",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Database(_))
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Join permitted. `durable` is false for ephemeral rooms, which are
    /// never hydrated from or written to the store.
    Allowed { durable: bool },
    Denied { reason: String },
    NotFound,
}

#[async_trait]
pub trait AccessGate: Send + Sync {
    async fn can_join(&self, identity: &Identity, room_id: &str) -> Result<AccessDecision, AccessError>;
}

/// Turn a room row into a decision. Split out so the policy is testable
/// without a database.
#[must_use]
pub fn decide(visibility: &str, persistence: &str, is_active: bool, is_member: bool) -> AccessDecision {
    if !is_active {
        return AccessDecision::NotFound;
    }
    let durable = !persistence.eq_ignore_ascii_case("EPHEMERAL");
    match visibility.to_ascii_uppercase().as_str() {
        "PUBLIC" | "UNLISTED" => AccessDecision::Allowed { durable },
        _ if is_member => AccessDecision::Allowed { durable },
        _ => AccessDecision::Denied { reason: "room is private".into() },
    }
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgAccessGate {
    pool: PgPool,
}

impl PgAccessGate {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessGate for PgAccessGate {
    async fn can_join(&self, identity: &Identity, room_id: &str) -> Result<AccessDecision, AccessError> {
        let row = sqlx::query(
            "SELECT
                 r.visibility,
                 r.persistence,
                 r.is_active,
                 (COALESCE(r.creator_id = $2, FALSE) OR EXISTS(
                     SELECT 1 FROM room_participants p
                     WHERE p.room_id = r.id AND p.user_id = $2
                 )) AS is_member
             FROM rooms r
             WHERE r.id = $1",
        )
        .bind(room_id)
        .bind(identity.id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(AccessDecision::NotFound);
        };
        let visibility: String = row.get("visibility");
        let persistence: String = row.get("persistence");
        Ok(decide(&visibility, &persistence, row.get("is_active"), row.get("is_member")))
    }
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
