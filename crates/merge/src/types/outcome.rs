//! Per-item merge outcomes as reported to the client.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::identity::Identity;

/// Why an item was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionKind {
    /// No identity could be derived.
    Identity,
    /// The payload is structurally invalid.
    Validation,
    /// A protected reference field was changed.
    Immutability,
    /// Concurrent writers kept winning until retries ran out.
    VersionConflict,
    /// The store failed to apply the write.
    Write,
    /// The caller may not write this resource.
    AccessDenied,
}

impl RejectionKind {
    /// Returns the OperationOutcome issue code for this kind.
    pub fn issue_code(&self) -> &'static str {
        match self {
            RejectionKind::Identity => "required",
            RejectionKind::Validation => "invalid",
            RejectionKind::Immutability => "business-rule",
            RejectionKind::VersionConflict => "conflict",
            RejectionKind::Write => "exception",
            RejectionKind::AccessDenied => "forbidden",
        }
    }
}

/// A rejected item's reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Category of the rejection.
    pub kind: RejectionKind,
    /// Human-readable reason.
    pub reason: String,
    /// JSON pointer of the offending field, when there is one.
    pub field: Option<String>,
}

impl Rejection {
    /// Creates a rejection without a field.
    pub fn new(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            field: None,
        }
    }

    /// Sets the offending field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Renders the rejection as an OperationOutcome issue.
    pub fn to_issue(&self) -> Value {
        let mut issue = json!({
            "severity": "error",
            "code": self.kind.issue_code(),
            "diagnostics": self.reason,
        });
        if let Some(field) = &self.field {
            issue["expression"] = json!([field]);
        }
        issue
    }
}

/// What happened to one submitted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStatus {
    /// A new resource was stored at version 1.
    Created,
    /// An existing resource got a new version.
    Updated,
    /// The merged document equals the stored one.
    Unchanged,
    /// The item was not written.
    Rejected(Rejection),
}

/// The result for one submitted payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// What happened.
    pub status: MergeStatus,
    /// Resource type of the payload, empty if it had none.
    pub resource_type: String,
    /// Logical id, if one was present or generated.
    pub logical_id: Option<String>,
    /// Surrogate id, once identity was resolved.
    pub surrogate_id: Option<Uuid>,
    /// Owning authority, once identity was resolved.
    pub owning_authority: Option<String>,
    /// The version now stored, if known.
    pub version: Option<u64>,
}

impl MergeOutcome {
    /// Builds a successful outcome for a resolved identity.
    pub fn for_identity(identity: &Identity, status: MergeStatus, version: Option<u64>) -> Self {
        Self {
            status,
            resource_type: identity.resource_type.clone(),
            logical_id: Some(identity.logical_id.clone()),
            surrogate_id: Some(identity.surrogate_id),
            owning_authority: Some(identity.owning_authority.clone()),
            version,
        }
    }

    /// Builds a rejection for a resolved identity.
    pub fn rejected_identity(identity: &Identity, rejection: Rejection) -> Self {
        Self::for_identity(identity, MergeStatus::Rejected(rejection), None)
    }

    /// Builds a rejection for a payload whose identity could not be resolved.
    pub fn rejected_payload(payload: &Value, rejection: Rejection) -> Self {
        Self {
            status: MergeStatus::Rejected(rejection),
            resource_type: payload
                .get("resourceType")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            logical_id: payload.get("id").and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            surrogate_id: None,
            owning_authority: None,
            version: None,
        }
    }

    /// Returns `true` if a new resource was created.
    pub fn created(&self) -> bool {
        self.status == MergeStatus::Created
    }

    /// Returns `true` if an existing resource received a new version.
    pub fn updated(&self) -> bool {
        self.status == MergeStatus::Updated
    }

    /// Returns the rejection, if the item was rejected.
    pub fn rejection(&self) -> Option<&Rejection> {
        match &self.status {
            MergeStatus::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientOutcome<'a> {
    id: Option<&'a str>,
    uuid: Option<Uuid>,
    source_assigning_authority: Option<&'a str>,
    resource_type: &'a str,
    created: bool,
    updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    issue: Option<Value>,
}

impl Serialize for MergeOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ClientOutcome {
            id: self.logical_id.as_deref(),
            uuid: self.surrogate_id,
            source_assigning_authority: self.owning_authority.as_deref(),
            resource_type: &self.resource_type,
            created: self.created(),
            updated: self.updated(),
            issue: self.rejection().map(Rejection::to_issue),
        }
        .serialize(serializer)
    }
}
