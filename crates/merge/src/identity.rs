//! Identity resolution.
//!
//! Every incoming payload is mapped to an [`Identity`]: its resource type,
//! the client-supplied logical id, the owning authority read from the
//! resource's security tags, and a deterministic surrogate id. Two payloads
//! with the same logical id but different owning authorities are different
//! resources.
//!
//! # Examples
//!
//! ```
//! use helios_merge::identity::{IdentityResolver, OWNER_SYSTEM};
//! use helios_merge::types::ResourceBuilder;
//!
//! let resolver = IdentityResolver::default();
//! let a = ResourceBuilder::new("Patient").id("1").security_tag(OWNER_SYSTEM, "A").build();
//! let b = ResourceBuilder::new("Patient").id("1").security_tag(OWNER_SYSTEM, "B").build();
//!
//! let ia = resolver.resolve(&a).unwrap();
//! assert_eq!(ia, resolver.resolve(&a).unwrap());
//! assert_ne!(ia.surrogate_id, resolver.resolve(&b).unwrap().surrogate_id);
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentityError;
use crate::types::Resource;

/// Security tag system naming the authority that assigned the logical id.
pub const SOURCE_ASSIGNING_AUTHORITY_SYSTEM: &str =
    "https://www.icanbwell.com/sourceAssigningAuthority";

/// Security tag system naming the owner; used when no assigning authority tag exists.
pub const OWNER_SYSTEM: &str = "https://www.icanbwell.com/owner";

/// Identifier system carrying the surrogate id on stored documents.
pub const UUID_IDENTIFIER_SYSTEM: &str = "https://www.icanbwell.com/uuid";

/// Identifier system carrying the client's logical id on stored documents.
pub const SOURCE_ID_IDENTIFIER_SYSTEM: &str = "https://www.icanbwell.com/sourceId";

/// Namespace for surrogate id derivation. Changing it re-keys every stored resource.
pub const SURROGATE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_9b3d_5c07_8e21_d4a0_b7f3_1e95);

/// Who a resource is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// FHIR resource type.
    pub resource_type: String,
    /// Client-supplied (or generated) id.
    pub logical_id: String,
    /// Stable internal key derived from the other three fields.
    pub surrogate_id: Uuid,
    /// Authority that assigned the logical id.
    pub owning_authority: String,
}

impl Identity {
    /// Returns `Type/id`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.logical_id)
    }

    /// Returns a copy of `resource` carrying this identity.
    ///
    /// The stored document gets the assigning-authority tag and the uuid and
    /// sourceId identifiers, so it can be resolved again without context.
    pub fn stamp(&self, resource: &Resource) -> Resource {
        resource
            .to_builder()
            .id(self.logical_id.clone())
            .security_tag(
                SOURCE_ASSIGNING_AUTHORITY_SYSTEM,
                self.owning_authority.clone(),
            )
            .identifier(UUID_IDENTIFIER_SYSTEM, self.surrogate_id.to_string())
            .identifier(SOURCE_ID_IDENTIFIER_SYSTEM, self.logical_id.clone())
            .build()
    }
}

/// Derives the surrogate id for a logical id.
///
/// Ids that already are UUIDs are used as-is, so clients that address
/// resources by surrogate converge on the same key.
pub fn surrogate_id(resource_type: &str, logical_id: &str, owning_authority: &str) -> Uuid {
    if let Ok(uuid) = Uuid::parse_str(logical_id) {
        return uuid;
    }
    let key = format!("{}|{}|{}", logical_id, owning_authority, resource_type);
    Uuid::new_v5(&SURROGATE_NAMESPACE, key.as_bytes())
}

/// Resolves the [`Identity`] of incoming payloads.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    default_authority: Option<String>,
    generate_missing_ids: bool,
}

impl IdentityResolver {
    /// Creates a resolver with no default authority that rejects missing ids.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the authority used when a payload carries no authority tag.
    pub fn with_default_authority(mut self, authority: impl Into<String>) -> Self {
        self.default_authority = Some(authority.into());
        self
    }

    /// Generates a random logical id for payloads without one.
    pub fn with_generated_ids(mut self, generate: bool) -> Self {
        self.generate_missing_ids = generate;
        self
    }

    /// Derives the identity of `resource`. Pure apart from id generation.
    pub fn resolve(&self, resource: &Resource) -> Result<Identity, IdentityError> {
        let resource_type = resource.resource_type().to_string();

        let logical_id = match resource.id() {
            Some(id) => {
                validate_id(id)?;
                id.to_string()
            }
            None if self.generate_missing_ids => Uuid::new_v4().to_string(),
            None => return Err(IdentityError::MissingId { resource_type }),
        };

        let owning_authority = resource
            .security_tag(SOURCE_ASSIGNING_AUTHORITY_SYSTEM)
            .or_else(|| resource.security_tag(OWNER_SYSTEM))
            .filter(|a| !a.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.default_authority.clone())
            .ok_or_else(|| IdentityError::MissingAuthority {
                resource_type: resource_type.clone(),
                id: logical_id.clone(),
            })?;

        let surrogate_id = surrogate_id(&resource_type, &logical_id, &owning_authority);

        Ok(Identity {
            resource_type,
            logical_id,
            surrogate_id,
            owning_authority,
        })
    }

    /// Resolves the identity and returns the stamped resource alongside it.
    pub fn resolve_and_stamp(
        &self,
        resource: &Resource,
    ) -> Result<(Identity, Resource), IdentityError> {
        let identity = self.resolve(resource)?;
        let stamped = identity.stamp(resource);
        Ok((identity, stamped))
    }
}

fn validate_id(id: &str) -> Result<(), IdentityError> {
    let invalid = |message: &str| IdentityError::InvalidId {
        id: id.to_string(),
        message: message.to_string(),
    };
    if id.trim().is_empty() {
        return Err(invalid("id is blank"));
    }
    if id.contains('/') || id.contains('|') {
        return Err(invalid("id must not contain '/' or '|'"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(invalid("id must not contain whitespace"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceBuilder;
    use serde_json::json;

    fn patient(id: &str, system: &str, authority: &str) -> Resource {
        ResourceBuilder::new("Patient")
            .id(id)
            .security_tag(system, authority)
            .build()
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = IdentityResolver::new();
        let resource = patient("12345", SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "clinic");
        let first = resolver.resolve(&resource).unwrap();
        let second = resolver.resolve(&resource).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.owning_authority, "clinic");
        assert_eq!(
            first.surrogate_id,
            surrogate_id("Patient", "12345", "clinic")
        );
    }

    #[test]
    fn test_authority_distinguishes_resources() {
        let resolver = IdentityResolver::new();
        let a = resolver
            .resolve(&patient("1", SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "A"))
            .unwrap();
        let b = resolver
            .resolve(&patient("1", SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "B"))
            .unwrap();
        assert_ne!(a.surrogate_id, b.surrogate_id);
    }

    #[test]
    fn test_resource_type_distinguishes_resources() {
        assert_ne!(
            surrogate_id("Patient", "1", "A"),
            surrogate_id("Person", "1", "A")
        );
    }

    #[test]
    fn test_owner_tag_fallback() {
        let identity = IdentityResolver::new()
            .resolve(&patient("1", OWNER_SYSTEM, "owner-org"))
            .unwrap();
        assert_eq!(identity.owning_authority, "owner-org");
    }

    #[test]
    fn test_assigning_authority_wins_over_owner() {
        let resource = ResourceBuilder::new("Patient")
            .id("1")
            .security_tag(OWNER_SYSTEM, "owner-org")
            .security_tag(SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "assigner")
            .build();
        let identity = IdentityResolver::new().resolve(&resource).unwrap();
        assert_eq!(identity.owning_authority, "assigner");
    }

    #[test]
    fn test_missing_authority() {
        let resource = ResourceBuilder::new("Patient").id("1").build();
        let err = IdentityResolver::new().resolve(&resource).unwrap_err();
        assert_eq!(
            err,
            IdentityError::MissingAuthority {
                resource_type: "Patient".to_string(),
                id: "1".to_string()
            }
        );

        let identity = IdentityResolver::new()
            .with_default_authority("fallback")
            .resolve(&resource)
            .unwrap();
        assert_eq!(identity.owning_authority, "fallback");
    }

    #[test]
    fn test_missing_id() {
        let resource = ResourceBuilder::new("Patient")
            .security_tag(OWNER_SYSTEM, "A")
            .build();
        let err = IdentityResolver::new().resolve(&resource).unwrap_err();
        assert!(matches!(err, IdentityError::MissingId { .. }));

        let identity = IdentityResolver::new()
            .with_generated_ids(true)
            .resolve(&resource)
            .unwrap();
        assert!(Uuid::parse_str(&identity.logical_id).is_ok());
    }

    #[test]
    fn test_uuid_id_passes_through() {
        let id = Uuid::new_v4();
        let identity = IdentityResolver::new()
            .resolve(&patient(&id.to_string(), OWNER_SYSTEM, "A"))
            .unwrap();
        assert_eq!(identity.surrogate_id, id);
    }

    #[test]
    fn test_long_ids_are_accepted() {
        let long_id = "x".repeat(80);
        let resolver = IdentityResolver::new();
        let a = resolver.resolve(&patient(&long_id, OWNER_SYSTEM, "A")).unwrap();
        let b = resolver.resolve(&patient(&long_id, OWNER_SYSTEM, "B")).unwrap();
        assert_ne!(a.surrogate_id, b.surrogate_id);
    }

    #[test]
    fn test_invalid_ids() {
        let resolver = IdentityResolver::new();
        for bad in ["a/b", "a|b", "a b", "   "] {
            let err = resolver.resolve(&patient(bad, OWNER_SYSTEM, "A")).unwrap_err();
            assert!(matches!(err, IdentityError::InvalidId { .. }), "{bad}");
        }
    }

    #[test]
    fn test_stamp_adds_keys() {
        let resource = patient("1", OWNER_SYSTEM, "A");
        let (identity, stamped) = IdentityResolver::new()
            .resolve_and_stamp(&resource)
            .unwrap();

        assert_eq!(
            stamped.identifier(UUID_IDENTIFIER_SYSTEM),
            Some(identity.surrogate_id.to_string().as_str())
        );
        assert_eq!(stamped.identifier(SOURCE_ID_IDENTIFIER_SYSTEM), Some("1"));
        assert_eq!(
            stamped.security_tag(SOURCE_ASSIGNING_AUTHORITY_SYSTEM),
            Some("A")
        );
        assert_eq!(stamped.security_tag(OWNER_SYSTEM), Some("A"));
        assert!(resource.identifier(UUID_IDENTIFIER_SYSTEM).is_none());
        assert_eq!(stamped.content()["resourceType"], json!("Patient"));
    }
}
