//! Identity resolution for websocket upgrades.
//!
//! ARCHITECTURE
//! ============
//! The HTTP service issues one-time, short-lived tickets; the websocket
//! upgrade carries one in its query string and this module resolves it to
//! the user behind it.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; a reconnect needs a fresh ticket.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Tickets are 16 random bytes, hex encoded.
pub const TICKET_HEX_LEN: usize = 32;

/// The authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: Uuid,
    /// Display name.
    pub name: String,
    pub avatar_url: Option<String>,
    /// Assigned presence color (hex).
    pub color: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    Required,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Required => "E_AUTH_REQUIRED",
            Self::Database(_) => "E_DATABASE",
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a ticket. `Ok(None)` for unknown, expired or reused tickets.
    async fn authenticate(&self, ticket: &str) -> Result<Option<Identity>, AuthError>;
}

/// Cheap shape check so obviously bogus tickets never reach the database.
#[must_use]
pub fn is_well_formed_ticket(ticket: &str) -> bool {
    ticket.len() == TICKET_HEX_LEN && ticket.bytes().all(|b| b.is_ascii_hexdigit())
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgAuthenticator {
    pool: PgPool,
}

impl PgAuthenticator {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Authenticator for PgAuthenticator {
    async fn authenticate(&self, ticket: &str) -> Result<Option<Identity>, AuthError> {
        if !is_well_formed_ticket(ticket) {
            return Ok(None);
        }

        let row = sqlx::query(
            r"WITH consumed AS (
                  DELETE FROM ws_tickets
                  WHERE ticket = $1 AND expires_at > now()
                  RETURNING user_id
              )
              SELECT u.id, u.name, u.avatar_url, u.color
              FROM consumed c
              JOIN users u ON u.id = c.user_id",
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Identity {
            id: r.get("id"),
            name: r.get("name"),
            avatar_url: r.get("avatar_url"),
            color: r.get("color"),
        }))
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
