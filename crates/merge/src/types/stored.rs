//! Persisted versions and history records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identity::Identity;

use super::resource::set_pointer;

/// HTTP method that produced a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceMethod {
    /// The version created the resource.
    Post,
    /// The version replaced an existing resource.
    Put,
}

impl ResourceMethod {
    /// Returns the method implied by the version number it produced.
    pub fn for_version(version: u64) -> Self {
        if version <= 1 {
            ResourceMethod::Post
        } else {
            ResourceMethod::Put
        }
    }

    /// Returns the method as its HTTP verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceMethod::Post => "POST",
            ResourceMethod::Put => "PUT",
        }
    }
}

/// The current committed version of a resource.
///
/// A store holds exactly one `StoredVersion` per (resource type, surrogate id).
/// `content.meta.versionId` and `content.meta.lastUpdated` always mirror
/// `version` and `last_modified`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVersion {
    /// Who the resource is.
    pub identity: Identity,

    /// Version counter, starting at 1.
    pub version: u64,

    /// When this version was committed.
    pub last_modified: DateTime<Utc>,

    /// The full document at this version.
    pub content: Value,
}

impl StoredVersion {
    /// Builds a committed version, stamping `meta.versionId` and `meta.lastUpdated`.
    pub fn committed(identity: Identity, version: u64, at: DateTime<Utc>, content: Value) -> Self {
        let mut content = content;
        set_pointer(&mut content, "/meta/versionId", Value::String(version.to_string()));
        set_pointer(
            &mut content,
            "/meta/lastUpdated",
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Self {
            identity,
            version,
            last_modified: at,
            content,
        }
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> &str {
        &self.identity.resource_type
    }

    /// Returns the surrogate id.
    pub fn surrogate_id(&self) -> Uuid {
        self.identity.surrogate_id
    }

    /// Returns the versioned reference `Type/id/_history/n`.
    pub fn versioned_reference(&self) -> String {
        format!(
            "{}/{}/_history/{}",
            self.identity.resource_type, self.identity.logical_id, self.version
        )
    }

    /// Turns this version into a history record.
    pub fn supersede(self, request_id: impl Into<String>, at: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord {
            method: ResourceMethod::for_version(self.version),
            version: self,
            request_id: request_id.into(),
            superseded_at: at,
        }
    }
}

/// An immutable copy of a version at the moment it was superseded.
///
/// Keyed by (resource type, surrogate id, version). The record names the
/// request that replaced the version, not the one that wrote it: for N > 1
/// the writer of version N is the `request_id` on the record for version
/// N - 1. The request that created version 1 is not recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// The superseded version.
    pub version: StoredVersion,

    /// The request whose write replaced this version.
    ///
    /// This is the request that produced version `version + 1`, not the one
    /// that produced `version`.
    pub request_id: String,

    /// When it was superseded.
    pub superseded_at: DateTime<Utc>,

    /// The method that produced the superseded version.
    pub method: ResourceMethod,
}

impl HistoryRecord {
    /// Returns the version counter of the superseded version.
    pub fn version_number(&self) -> u64 {
        self.version.version
    }
}

/// A single compare-and-swap request.
#[derive(Debug, Clone)]
pub struct CasWrite {
    /// The resource being written.
    pub identity: Identity,

    /// The version that must currently be stored; 0 means "must not exist".
    pub expected_version: u64,

    /// The new document. The store stamps `meta.versionId` and `meta.lastUpdated`.
    pub content: Value,

    /// Request that issued the write, recorded on the history record.
    pub request_id: String,
}

impl CasWrite {
    /// Returns the version this write produces when applied.
    pub fn next_version(&self) -> u64 {
        self.expected_version + 1
    }
}

/// The result of a compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The write was applied; holds the new current version.
    Applied(StoredVersion),

    /// The stored version differed from the expected one.
    Mismatch {
        /// The version actually stored, if any.
        current_version: Option<u64>,
    },
}

impl CasOutcome {
    /// Returns `true` if the write was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}
