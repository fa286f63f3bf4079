//! SQLite store.
//!
//! Supports in-memory databases (for tests) and file-based databases. Each
//! compare-and-swap runs in an immediate transaction: the conditional
//! update of the current row and the history insert commit together or not
//! at all.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE resources (
//!     resource_type TEXT NOT NULL,
//!     surrogate_id TEXT NOT NULL,
//!     logical_id TEXT NOT NULL,
//!     owning_authority TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     last_modified TEXT NOT NULL,
//!     data TEXT NOT NULL,
//!     PRIMARY KEY (resource_type, surrogate_id)
//! );
//!
//! CREATE TABLE resource_history (
//!     resource_type TEXT NOT NULL,
//!     surrogate_id TEXT NOT NULL,
//!     logical_id TEXT NOT NULL,
//!     owning_authority TEXT NOT NULL,
//!     version INTEGER NOT NULL,
//!     last_modified TEXT NOT NULL,
//!     data TEXT NOT NULL,
//!     request_id TEXT NOT NULL,
//!     superseded_at TEXT NOT NULL,
//!     method TEXT NOT NULL,
//!     PRIMARY KEY (resource_type, surrogate_id, version)
//! );
//! ```

mod schema;
mod store;

pub use store::{SqliteStore, SqliteStoreConfig};
