//! Storage abstraction for the write path.
//!
//! A [`ResourceStore`] keeps, per resource type, one current version per
//! surrogate id and an append-only history of superseded versions. The only
//! write primitive is compare-and-swap on the version counter; every applied
//! swap that replaces a version appends that version to history in the same
//! atomic step.
//!
//! # Examples
//!
//! ```
//! use helios_merge::identity::{IdentityResolver, OWNER_SYSTEM};
//! use helios_merge::store::{MemoryStore, ResourceStore};
//! use helios_merge::types::{CasWrite, ResourceBuilder};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryStore::new();
//! let patient = ResourceBuilder::new("Patient").id("1").security_tag(OWNER_SYSTEM, "A").build();
//! let identity = IdentityResolver::default().resolve(&patient).unwrap();
//!
//! let outcome = store
//!     .compare_and_swap(CasWrite {
//!         identity: identity.clone(),
//!         expected_version: 0,
//!         content: patient.into_content(),
//!         request_id: "req-1".to_string(),
//!     })
//!     .await
//!     .unwrap();
//! assert!(outcome.is_applied());
//! # }
//! ```

mod memory;

use std::fmt::{self, Debug};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::types::{CasOutcome, CasWrite, HistoryRecord, StoredVersion};

pub use memory::MemoryStore;

/// Identifies a store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// In-process maps.
    Memory,
    /// SQLite database (file-based or in-memory).
    Sqlite,
    /// Custom or wrapping store.
    Custom(&'static str),
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::Sqlite => write!(f, "sqlite"),
            StoreKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Current and history storage with compare-and-swap writes.
///
/// Implementations must never hold an in-memory lock across an `.await`;
/// the version check is the only concurrency control.
#[async_trait]
pub trait ResourceStore: Send + Sync + Debug {
    /// Returns the kind of store.
    fn kind(&self) -> StoreKind;

    /// Returns a name for logs and errors.
    fn backend_name(&self) -> &'static str {
        match self.kind() {
            StoreKind::Memory => "memory",
            StoreKind::Sqlite => "sqlite",
            StoreKind::Custom(name) => name,
        }
    }

    /// Fails with [`StorageError::Unavailable`](crate::error::StorageError::Unavailable)
    /// if the store cannot serve writes.
    async fn health_check(&self) -> StorageResult<()>;

    /// Reads the current version.
    async fn read_current(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Option<StoredVersion>>;

    /// Reads a specific version, current or historical.
    async fn read_version(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
        version: u64,
    ) -> StorageResult<Option<StoredVersion>>;

    /// Applies a write only if the stored version equals `expected_version`.
    ///
    /// With `expected_version == 0` the write is an insert that succeeds only
    /// when nothing is stored. On success the new version is
    /// `expected_version + 1` with a fresh timestamp, and the replaced
    /// version is appended to history atomically with the replace.
    async fn compare_and_swap(&self, write: CasWrite) -> StorageResult<CasOutcome>;

    /// Applies several independent swaps, returning one outcome per write in order.
    ///
    /// Each write is checked on its own; a mismatch on one does not affect
    /// the others.
    async fn bulk_compare_and_swap(&self, writes: Vec<CasWrite>) -> StorageResult<Vec<CasOutcome>> {
        let mut outcomes = Vec::with_capacity(writes.len());
        for write in writes {
            outcomes.push(self.compare_and_swap(write).await?);
        }
        Ok(outcomes)
    }

    /// Returns every superseded version of a resource, oldest first.
    async fn history(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Vec<HistoryRecord>>;

    /// Returns superseded versions of a type modified at or after `since`, newest first.
    async fn history_since(
        &self,
        resource_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<HistoryRecord>>;

    /// Counts current resources of a type.
    async fn count(&self, resource_type: &str) -> StorageResult<u64>;
}
