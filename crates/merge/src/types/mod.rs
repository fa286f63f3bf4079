//! Core value types for the merge write path.
//!
//! - [`Resource`], [`ResourceBuilder`] - immutable FHIR documents
//! - [`StoredVersion`], [`HistoryRecord`] - what the store persists
//! - [`CasWrite`], [`CasOutcome`] - compare-and-swap requests and results
//! - [`MergeOutcome`] - the per-item result returned to clients
//!
//! # Examples
//!
//! ```
//! use helios_merge::types::{MergeOutcome, MergeStatus, ResourceBuilder};
//! use helios_merge::identity::IdentityResolver;
//!
//! let patient = ResourceBuilder::new("Patient")
//!     .id("12345")
//!     .security_tag("https://www.icanbwell.com/owner", "clinic")
//!     .build();
//!
//! let identity = IdentityResolver::default().resolve(&patient).unwrap();
//! let outcome = MergeOutcome::for_identity(&identity, MergeStatus::Created, Some(1));
//!
//! let body = serde_json::to_value(&outcome).unwrap();
//! assert_eq!(body["created"], true);
//! assert_eq!(body["sourceAssigningAuthority"], "clinic");
//! ```

mod outcome;
mod resource;
mod stored;

pub use outcome::{MergeOutcome, MergeStatus, Rejection, RejectionKind};
pub use resource::{Reference, Resource, ResourceBuilder};
pub(crate) use resource::{remove_pointer, set_pointer};
pub use stored::{CasOutcome, CasWrite, HistoryRecord, ResourceMethod, StoredVersion};
