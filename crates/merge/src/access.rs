//! Collaborators consulted before a write: structure validation and access control.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{Operation, RequestContext};
use crate::error::ValidationError;
use crate::identity::Identity;
use crate::types::Resource;

/// Checks a payload's structure before identity resolution.
pub trait StructureValidator: Send + Sync + std::fmt::Debug {
    /// Returns an error if the resource is structurally invalid.
    fn validate_structure(&self, resource: &Resource) -> Result<(), ValidationError>;
}

/// Checks only what the write path itself relies on.
///
/// `resourceType` presence is enforced when the [`Resource`] is parsed; this
/// adds that `meta` and `meta.security`, when present, have the right shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicStructureValidator;

impl StructureValidator for BasicStructureValidator {
    fn validate_structure(&self, resource: &Resource) -> Result<(), ValidationError> {
        let invalid = |message: &str| ValidationError::InvalidResource {
            message: message.to_string(),
        };
        match resource.content().get("meta") {
            None => return Ok(()),
            Some(Value::Object(_)) => {}
            Some(_) => return Err(invalid("meta must be an object")),
        }
        match resource.pointer("/meta/security") {
            None => Ok(()),
            Some(Value::Array(tags)) if tags.iter().all(Value::is_object) => Ok(()),
            Some(_) => Err(invalid("meta.security must be an array of codings")),
        }
    }
}

/// The result of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// The operation may proceed.
    Allow,
    /// The operation is denied, with a reason.
    Deny(String),
}

/// Decides whether a request may perform an operation on a resource.
#[async_trait]
pub trait AccessEvaluator: Send + Sync + std::fmt::Debug {
    /// Evaluates the request.
    async fn authorize(
        &self,
        identity: &Identity,
        operation: Operation,
        ctx: &RequestContext,
    ) -> AccessDecision;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AccessEvaluator for AllowAll {
    async fn authorize(&self, _: &Identity, _: Operation, _: &RequestContext) -> AccessDecision {
        AccessDecision::Allow
    }
}

/// Grants writes based on SMART-style scopes on the request.
///
/// Accepts `user/`, `patient/` and `system/` scopes naming the resource type
/// or `*`, with a `write` or `*` action or a v2 permission string
/// (`c` for create, `u` for update).
///
/// # Examples
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use helios_merge::access::{AccessDecision, AccessEvaluator, ScopeAccessEvaluator};
/// use helios_merge::context::{Operation, RequestContext};
/// use helios_merge::identity::Identity;
/// use uuid::Uuid;
///
/// let identity = Identity {
///     resource_type: "Observation".to_string(),
///     logical_id: "1".to_string(),
///     surrogate_id: Uuid::nil(),
///     owning_authority: "clinic".to_string(),
/// };
/// let ctx = RequestContext::new("r").with_scopes(["user/Observation.write"]);
///
/// let decision = ScopeAccessEvaluator.authorize(&identity, Operation::Merge, &ctx).await;
/// assert_eq!(decision, AccessDecision::Allow);
/// # }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeAccessEvaluator;

impl ScopeAccessEvaluator {
    fn grants(scope: &str, resource_type: &str, operation: Operation) -> bool {
        let Some((context, rest)) = scope.split_once('/') else {
            return false;
        };
        if !matches!(context, "user" | "patient" | "system") {
            return false;
        }
        let Some((scope_type, action)) = rest.split_once('.') else {
            return false;
        };
        if scope_type != "*" && scope_type != resource_type {
            return false;
        }
        let action = action.split('?').next().unwrap_or_default();
        match action {
            "*" | "write" => true,
            "read" => false,
            v2 => match operation {
                Operation::Create => v2.contains('c'),
                Operation::Update => v2.contains('u'),
                Operation::Merge => v2.contains('c') && v2.contains('u'),
            },
        }
    }
}

#[async_trait]
impl AccessEvaluator for ScopeAccessEvaluator {
    async fn authorize(
        &self,
        identity: &Identity,
        operation: Operation,
        ctx: &RequestContext,
    ) -> AccessDecision {
        let granted = ctx
            .scopes()
            .iter()
            .any(|scope| Self::grants(scope, &identity.resource_type, operation));
        if granted {
            AccessDecision::Allow
        } else {
            AccessDecision::Deny(format!(
                "no scope grants {} on {}",
                operation, identity.resource_type
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceBuilder;
    use serde_json::json;
    use uuid::Uuid;

    fn identity(resource_type: &str) -> Identity {
        Identity {
            resource_type: resource_type.to_string(),
            logical_id: "1".to_string(),
            surrogate_id: Uuid::nil(),
            owning_authority: "A".to_string(),
        }
    }

    #[test]
    fn test_basic_structure_validator() {
        let validator = BasicStructureValidator;
        let ok = ResourceBuilder::new("Patient").build();
        assert!(validator.validate_structure(&ok).is_ok());

        let bad_meta = ResourceBuilder::new("Patient").field("meta", json!("x")).build();
        assert!(validator.validate_structure(&bad_meta).is_err());

        let bad_security = ResourceBuilder::new("Patient")
            .pointer("/meta/security", json!(["owner"]))
            .build();
        assert!(validator.validate_structure(&bad_security).is_err());
    }

    #[test]
    fn test_scope_grants() {
        assert!(ScopeAccessEvaluator::grants("user/Observation.write", "Observation", Operation::Merge));
        assert!(ScopeAccessEvaluator::grants("system/*.*", "Patient", Operation::Merge));
        assert!(ScopeAccessEvaluator::grants("patient/Patient.cu", "Patient", Operation::Merge));
        assert!(ScopeAccessEvaluator::grants("user/Patient.c", "Patient", Operation::Create));
        assert!(!ScopeAccessEvaluator::grants("user/Patient.c", "Patient", Operation::Merge));
        assert!(!ScopeAccessEvaluator::grants("user/Patient.read", "Patient", Operation::Merge));
        assert!(!ScopeAccessEvaluator::grants("user/Patient.write", "Observation", Operation::Merge));
        assert!(!ScopeAccessEvaluator::grants("openid", "Patient", Operation::Merge));
    }

    #[tokio::test]
    async fn test_scope_evaluator_denies_without_scope() {
        let ctx = RequestContext::new("r").with_scopes(["user/Patient.read"]);
        let decision = ScopeAccessEvaluator
            .authorize(&identity("Patient"), Operation::Merge, &ctx)
            .await;
        assert!(matches!(decision, AccessDecision::Deny(reason) if reason.contains("Patient")));
    }

    #[tokio::test]
    async fn test_allow_all() {
        let ctx = RequestContext::new("r");
        assert_eq!(
            AllowAll.authorize(&identity("Task"), Operation::Merge, &ctx).await,
            AccessDecision::Allow
        );
    }
}
