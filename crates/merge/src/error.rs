//! Error types for the merge engine.
//!
//! Errors are split by the stage of the write path that raises them:
//! identity resolution, structural validation, cross-version invariants,
//! concurrency control, the storage layer, and post-commit work. Item-level
//! errors are turned into rejected outcomes by the batch executor; only
//! [`MergeError::BatchAborted`] fails a whole request.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::types::{Rejection, RejectionKind};

/// The umbrella error type for the merge write path.
#[derive(Error, Debug)]
pub enum MergeError {
    /// Identity could not be derived from the payload.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The payload failed structural validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A protected reference field was changed.
    #[error(transparent)]
    Immutability(#[from] ImmutabilityViolation),

    /// Compare-and-swap retries were exhausted.
    #[error("version conflict on {resource_type}/{surrogate_id} after {attempts} attempts")]
    VersionConflict {
        resource_type: String,
        surrogate_id: Uuid,
        attempts: u32,
    },

    /// Storage fault that outlived its retries.
    #[error(transparent)]
    Write(#[from] StorageError),

    /// The access-control evaluator denied the operation.
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// The item was rejected for a reason that has no typed error.
    #[error("{}", .0.reason)]
    Rejected(Rejection),

    /// The whole batch was aborted before any item was written.
    #[error("batch aborted: {reason}")]
    BatchAborted { reason: String },

    /// Deferred work for a request did not finish in time.
    #[error("deferred tasks for request {request_id} did not finish within {timeout:?} ({pending} pending)")]
    DeferredTaskTimeout {
        request_id: String,
        pending: usize,
        timeout: Duration,
    },
}

/// Errors raised while deriving a resource identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No logical id present and id generation is disabled.
    #[error("resource {resource_type} has no id and none can be generated")]
    MissingId { resource_type: String },

    /// No owning authority could be read or defaulted.
    #[error("resource {resource_type}/{id} has no owning authority tag")]
    MissingAuthority { resource_type: String, id: String },

    /// The logical id violates the FHIR id rules.
    #[error("invalid id '{id}': {message}")]
    InvalidId { id: String, message: String },
}

/// Structural validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload has no `resourceType`.
    #[error("resource is missing resourceType")]
    MissingResourceType,

    /// The payload is not a JSON object or is otherwise malformed.
    #[error("invalid resource: {message}")]
    InvalidResource { message: String },

    /// The payload type differs from the one it is being merged into.
    #[error("resource type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },
}

/// A protected reference field differs between the stored and incoming document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field {field} of {resource_type} cannot be changed from '{stored}' to '{incoming}'")]
pub struct ImmutabilityViolation {
    pub resource_type: String,
    pub field: String,
    pub stored: String,
    pub incoming: String,
}

/// Errors originating from a resource store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store is unavailable.
    #[error("store unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    /// Connecting to the store failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// A unique key already holds a document.
    #[error("document already exists: {resource_type}/{surrogate_id}")]
    Conflict {
        resource_type: String,
        surrogate_id: Uuid,
    },

    /// Internal store error.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl StorageError {
    /// Returns `true` if the store as a whole cannot serve requests.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. } | StorageError::ConnectionFailed { .. }
        )
    }
}

/// Result type alias for merge operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// Result type alias for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl MergeError {
    /// Converts an item-level error into the rejection returned to the client.
    pub fn to_rejection(&self) -> Rejection {
        if let MergeError::Rejected(rejection) = self {
            return rejection.clone();
        }
        let kind = match self {
            MergeError::Identity(_) => RejectionKind::Identity,
            MergeError::Validation(_) => RejectionKind::Validation,
            MergeError::Immutability(_) => RejectionKind::Immutability,
            MergeError::VersionConflict { .. } => RejectionKind::VersionConflict,
            MergeError::Write(_) => RejectionKind::Write,
            MergeError::AccessDenied { .. } => RejectionKind::AccessDenied,
            MergeError::Rejected(rejection) => rejection.kind,
            MergeError::BatchAborted { .. } | MergeError::DeferredTaskTimeout { .. } => {
                RejectionKind::Write
            }
        };
        let field = match self {
            MergeError::Immutability(violation) => Some(violation.field.clone()),
            _ => None,
        };
        Rejection {
            kind,
            reason: self.to_string(),
            field,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        StorageError::ConnectionFailed {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
        }
    }
}
