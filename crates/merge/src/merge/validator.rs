//! Create / update / unchanged / reject decisions.

use serde_json::Value;
use tracing::debug;

use crate::error::{MergeError, ValidationError};
use crate::identity::Identity;
use crate::types::{
    Rejection, RejectionKind, Resource, StoredVersion, remove_pointer, set_pointer,
};

use super::policy::ImmutabilityPolicy;
use super::smart_merge::smart_merge;
use super::{Decision, FoldResult, MergeMode};

/// Fields the server owns. They never count as a change.
const SERVER_MANAGED: &[&str] = &["/meta/versionId", "/meta/lastUpdated"];

/// Decides what a payload does to the stored state.
///
/// The validator is pure: it reads nothing and writes nothing. Callers pass
/// in the current stored version and act on the returned [`Decision`].
#[derive(Debug, Clone, Default)]
pub struct MergeValidator {
    policy: ImmutabilityPolicy,
    mode: MergeMode,
}

impl MergeValidator {
    /// Creates a validator with the given policy and smart merging.
    pub fn new(policy: ImmutabilityPolicy) -> Self {
        Self {
            policy,
            mode: MergeMode::Smart,
        }
    }

    /// Sets the merge mode.
    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the immutability policy.
    pub fn policy(&self) -> &ImmutabilityPolicy {
        &self.policy
    }

    /// Returns the merge mode.
    pub fn mode(&self) -> MergeMode {
        self.mode
    }

    /// Decides what `incoming` does to `current`.
    ///
    /// `incoming` is stamped with `identity` before comparison, so the
    /// identity keys never show up as a change. Errors become
    /// [`Decision::Reject`].
    pub fn decide(
        &self,
        incoming: &Resource,
        identity: &Identity,
        current: Option<&StoredVersion>,
    ) -> Decision {
        match self.try_decide(incoming, identity, current) {
            Ok(decision) => decision,
            Err(err) => Decision::Reject(err.to_rejection()),
        }
    }

    /// Like [`decide`](Self::decide), but returns the typed error instead of
    /// a rejection. Never returns [`Decision::Reject`].
    pub fn try_decide(
        &self,
        incoming: &Resource,
        identity: &Identity,
        current: Option<&StoredVersion>,
    ) -> Result<Decision, MergeError> {
        let incoming = identity.stamp(incoming);

        let Some(current) = current else {
            let mut content = incoming.into_content();
            strip_server_managed(&mut content);
            return Ok(Decision::Create(content));
        };

        let stored_type = current
            .content
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or(&current.identity.resource_type);
        if stored_type != incoming.resource_type() {
            return Err(ValidationError::TypeMismatch {
                expected: stored_type.to_string(),
                actual: incoming.resource_type().to_string(),
            }
            .into());
        }

        let merged = self.merged_content(&current.content, incoming.content());

        if let Err(violation) =
            self.policy
                .check(&identity.resource_type, &current.content, &merged)
        {
            debug!(
                resource_type = %identity.resource_type,
                surrogate_id = %identity.surrogate_id,
                field = %violation.field,
                "Rejecting change to immutable field"
            );
            return Err(violation.into());
        }

        if is_unchanged(&current.content, &merged) {
            Ok(Decision::Unchanged {
                version: current.version,
            })
        } else {
            Ok(Decision::Update {
                expected_version: current.version,
                content: merged,
            })
        }
    }

    /// Folds successive submissions for one identity into a net decision.
    ///
    /// Each item is decided against the result of the previous one. A
    /// rejection at any step rejects the whole unit with that reason.
    pub fn fold(
        &self,
        items: &[Resource],
        identity: &Identity,
        current: Option<&StoredVersion>,
    ) -> FoldResult {
        let mut working: Option<StoredVersion> = current.cloned();
        let mut steps = Vec::with_capacity(items.len());

        for item in items {
            let decision = self.decide(item, identity, working.as_ref());
            match &decision {
                Decision::Create(content) => {
                    working = Some(StoredVersion {
                        identity: identity.clone(),
                        version: 0,
                        last_modified: chrono::Utc::now(),
                        content: content.clone(),
                    });
                }
                Decision::Update { content, .. } => {
                    if let Some(working) = working.as_mut() {
                        working.content = content.clone();
                    }
                }
                Decision::Unchanged { .. } => {}
                Decision::Reject(rejection) => {
                    return FoldResult::Rejected(rejection.clone());
                }
            }
            steps.push(decision);
        }

        let net = match (current, working) {
            (None, Some(working)) => Decision::Create(working.content),
            (Some(current), Some(working)) if !is_unchanged(&current.content, &working.content) => {
                Decision::Update {
                    expected_version: current.version,
                    content: working.content,
                }
            }
            (Some(current), _) => Decision::Unchanged {
                version: current.version,
            },
            (None, None) => Decision::Reject(Rejection::new(
                RejectionKind::Validation,
                "no submissions to fold",
            )),
        };

        FoldResult::Accepted { net, steps }
    }

    fn merged_content(&self, stored: &Value, incoming: &Value) -> Value {
        let mut merged = match self.mode {
            MergeMode::Smart => smart_merge(stored, incoming),
            MergeMode::Replace => incoming.clone(),
        };

        for pointer in SERVER_MANAGED {
            match stored.pointer(pointer) {
                Some(value) => set_pointer(&mut merged, pointer, value.clone()),
                None => remove_pointer(&mut merged, pointer),
            }
        }
        if merged.pointer("/meta/source").is_none() {
            if let Some(source) = stored.pointer("/meta/source") {
                set_pointer(&mut merged, "/meta/source", source.clone());
            }
        }
        if let Some(id) = stored.get("id") {
            set_pointer(&mut merged, "/id", id.clone());
        }
        merged
    }
}

fn strip_server_managed(content: &mut Value) {
    for pointer in SERVER_MANAGED {
        remove_pointer(content, pointer);
    }
}

/// Compares documents ignoring server-managed fields.
fn is_unchanged(stored: &Value, merged: &Value) -> bool {
    let mut left = stored.clone();
    let mut right = merged.clone();
    strip_server_managed(&mut left);
    strip_server_managed(&mut right);
    remove_pointer(&mut left, "/id");
    remove_pointer(&mut right, "/id");
    json_patch::diff(&left, &right).0.is_empty()
}
