//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the room registry plus the identity and access seams. The
//! Postgres implementations are wired in `main`; tests substitute the
//! in-memory doubles from `test_helpers`.

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::services::access::AccessGate;
use crate::services::room::RoomRegistry;
use crate::services::session::Authenticator;
use crate::services::store::BlobStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; every field is Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub auth: Arc<dyn Authenticator>,
    pub gate: Arc<dyn AccessGate>,
    pub config: SyncConfig,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn BlobStore>,
        auth: Arc<dyn Authenticator>,
        gate: Arc<dyn AccessGate>,
        config: SyncConfig,
    ) -> Self {
        Self { registry: RoomRegistry::new(store, config), auth, gate, config }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
