//! Merge decisions.
//!
//! [`MergeValidator::decide`] compares an incoming payload with the current
//! stored version and returns a [`Decision`]. Nothing here touches storage.
//!
//! # Examples
//!
//! ```
//! use helios_merge::identity::{IdentityResolver, OWNER_SYSTEM};
//! use helios_merge::merge::{Decision, ImmutabilityPolicy, MergeValidator};
//! use helios_merge::types::ResourceBuilder;
//!
//! let validator = MergeValidator::new(ImmutabilityPolicy::clinical_defaults());
//! let patient = ResourceBuilder::new("Patient")
//!     .id("12345")
//!     .security_tag(OWNER_SYSTEM, "clinic")
//!     .build();
//! let identity = IdentityResolver::default().resolve(&patient).unwrap();
//!
//! assert!(matches!(validator.decide(&patient, &identity, None), Decision::Create(_)));
//! ```

mod policy;
mod smart_merge;
mod validator;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Rejection;

pub use policy::ImmutabilityPolicy;
pub use smart_merge::smart_merge;
pub use validator::MergeValidator;

/// How an incoming payload is combined with the stored document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Deep merge onto the stored document.
    #[default]
    Smart,
    /// The incoming document replaces the stored one.
    Replace,
}

/// What to do with one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Store the content as version 1.
    Create(Value),
    /// Replace `expected_version` with the content.
    Update {
        /// Version the content was computed against.
        expected_version: u64,
        /// The merged document.
        content: Value,
    },
    /// Nothing to write.
    Unchanged {
        /// The version already stored.
        version: u64,
    },
    /// Do not write.
    Reject(Rejection),
}

impl Decision {
    /// Returns the version a write for this decision expects, if it writes.
    pub fn expected_version(&self) -> Option<u64> {
        match self {
            Decision::Create(_) => Some(0),
            Decision::Update {
                expected_version, ..
            } => Some(*expected_version),
            Decision::Unchanged { .. } | Decision::Reject(_) => None,
        }
    }
}

/// Result of folding several submissions for one identity.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldResult {
    /// Every step was accepted.
    Accepted {
        /// The net decision relative to the stored version.
        net: Decision,
        /// Each item's decision against the previous step's result.
        steps: Vec<Decision>,
    },
    /// A step was rejected; the whole unit is.
    Rejected(Rejection),
}
