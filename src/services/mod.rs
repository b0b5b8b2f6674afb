//! Domain services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room state and the storage, identity and access
//! seams, so route handlers stay focused on protocol translation.

pub mod access;
pub mod persistence;
pub mod presence;
pub mod room;
pub mod session;
pub mod store;
