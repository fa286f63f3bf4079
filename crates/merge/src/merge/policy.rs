//! Immutable reference fields per resource type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ImmutabilityViolation;

/// Maps resource types to JSON pointers whose values may not change once set.
///
/// The policy is configuration data; [`ImmutabilityPolicy::clinical_defaults`]
/// is a starting point, not a fixed rule set.
///
/// # Examples
///
/// ```
/// use helios_merge::merge::ImmutabilityPolicy;
/// use serde_json::json;
///
/// let policy = ImmutabilityPolicy::clinical_defaults();
/// let stored = json!({"resourceType": "Observation", "subject": {"reference": "Patient/12345"}});
/// let incoming = json!({"resourceType": "Observation", "subject": {"reference": "Patient/99999"}});
///
/// let violation = policy.check("Observation", &stored, &incoming).unwrap_err();
/// assert_eq!(violation.field, "/subject/reference");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImmutabilityPolicy {
    fields: HashMap<String, Vec<String>>,
}

impl ImmutabilityPolicy {
    /// Creates an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subject and assignee references of common clinical resources.
    pub fn clinical_defaults() -> Self {
        Self::new()
            .with_field("Observation", "/subject/reference")
            .with_field("Condition", "/subject/reference")
            .with_field("Encounter", "/subject/reference")
            .with_field("Procedure", "/subject/reference")
            .with_field("MedicationRequest", "/subject/reference")
            .with_field("Task", "/owner/reference")
    }

    /// Adds a protected JSON pointer for a resource type.
    pub fn with_field(mut self, resource_type: impl Into<String>, pointer: impl Into<String>) -> Self {
        let pointer = pointer.into();
        let entry = self.fields.entry(resource_type.into()).or_default();
        if !entry.contains(&pointer) {
            entry.push(pointer);
        }
        self
    }

    /// Returns the protected pointers for a resource type.
    pub fn fields_for(&self, resource_type: &str) -> &[String] {
        self.fields
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns `true` if no fields are protected.
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(Vec::is_empty)
    }

    /// Checks that every protected field set on `stored` is unchanged in `incoming`.
    pub fn check(
        &self,
        resource_type: &str,
        stored: &Value,
        incoming: &Value,
    ) -> Result<(), ImmutabilityViolation> {
        for pointer in self.fields_for(resource_type) {
            let Some(before) = stored.pointer(pointer).filter(|v| !v.is_null()) else {
                continue;
            };
            let after = incoming.pointer(pointer);
            if after != Some(before) {
                return Err(ImmutabilityViolation {
                    resource_type: resource_type.to_string(),
                    field: pointer.clone(),
                    stored: render(Some(before)),
                    incoming: render(after),
                });
            }
        }
        Ok(())
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "<absent>".to_string(),
        Some(other) => other.to_string(),
    }
}
