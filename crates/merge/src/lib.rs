//! Helios FHIR Server Merge Engine
//!
//! This crate implements the `$merge` write path: clients submit one or
//! more FHIR resources and each one is created, updated, left unchanged, or
//! rejected, with optimistic concurrency, gapless version history, and
//! post-commit work that runs once the writes are visible.
//!
//! # Features
//!
//! - **Deterministic identity**: every resource maps to a stable surrogate id
//!   derived from its type, logical id and owning authority
//! - **Smart merge**: incoming documents merge into the stored one, with
//!   array entries matched by `id` or `sequence`
//! - **Immutable references**: configured fields (e.g. `subject`) may not be
//!   re-pointed once set
//! - **Compare-and-swap writes**: bounded retry with backoff, re-validating
//!   against the newest version after every lost race
//! - **History**: every superseded version is kept, keyed by version number
//! - **Batches**: per-item outcomes in input order; one bad item never sinks
//!   the rest
//! - **Post-commit tasks**: audit events and change notifications, retried
//!   and awaitable per request
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite store with in-memory and file modes
//! - `logging` (default) - [`init_logging`] subscriber helper
//!
//! # Architecture
//!
//! - [`identity`] - Identity resolution and surrogate ids
//! - [`merge`] - Merge decisions and the immutability policy
//! - [`writer`] - Compare-and-swap writer with retry
//! - [`batch`] - Request-scoped batch execution
//! - [`postcommit`] - Deferred tasks per request
//! - [`store`] - The storage trait and the in-memory store
//! - [`backends`] - Database-backed stores
//! - [`engine`] - The request driver tying it together
//! - [`error`] - Error types for all operations
//!
//! # Quick Start
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use helios_merge::{MemoryStore, MergeConfig, MergeEngine, RequestContext};
//! use serde_json::json;
//!
//! let engine = MergeEngine::new(
//!     MergeConfig {
//!         default_authority: Some("clinic".to_string()),
//!         ..MergeConfig::for_testing()
//!     },
//!     Arc::new(MemoryStore::new()),
//! );
//!
//! let ctx = RequestContext::new("req-1");
//! let outcomes = engine
//!     .merge(&ctx, vec![json!({
//!         "resourceType": "Observation",
//!         "id": "obs-1",
//!         "status": "final",
//!         "subject": { "reference": "Patient/12345" }
//!     })])
//!     .await
//!     .unwrap();
//!
//! assert!(outcomes[0].created());
//! assert_eq!(outcomes[0].version, Some(1));
//!
//! engine.wait_till_done("req-1").await.unwrap();
//! # }
//! ```
//!
//! # Immutable fields
//!
//! ```
//! use helios_merge::merge::ImmutabilityPolicy;
//!
//! let policy = ImmutabilityPolicy::clinical_defaults()
//!     .with_field("Patient", "/managingOrganization/reference");
//!
//! assert!(policy.fields_for("Observation").contains(&"/subject/reference".to_string()));
//! assert_eq!(policy.fields_for("Patient").len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod access;
pub mod backends;
pub mod batch;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod identity;
#[cfg(feature = "logging")]
pub mod logging;
pub mod merge;
pub mod postcommit;
pub mod store;
pub mod types;
pub mod writer;

// Re-export commonly used types at crate root
pub use config::{DeferredTaskConfig, MergeConfig, MergeSettings, RetryPolicy};
pub use context::{Operation, RequestContext};
pub use engine::{MergeEngine, payloads_from_body};
pub use error::{MergeError, MergeResult, StorageError, StorageResult};
pub use identity::{Identity, IdentityResolver};
pub use store::{MemoryStore, ResourceStore};
pub use types::{MergeOutcome, MergeStatus, Rejection, RejectionKind, Resource, ResourceBuilder};

// Re-export the write path components
pub use batch::{BatchExecutor, BatchJob};
pub use merge::{ImmutabilityPolicy, MergeMode, MergeValidator};
pub use postcommit::{ChangeEvent, DeferredTask, PostCommitProcessor};
pub use writer::ConcurrencyWriter;

#[cfg(feature = "logging")]
pub use logging::init_logging;

#[cfg(feature = "sqlite")]
pub use backends::sqlite::{SqliteStore, SqliteStoreConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
