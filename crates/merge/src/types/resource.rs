//! Resource values and their builder.
//!
//! A [`Resource`] is an immutable FHIR document tagged with its type. Changes
//! are made by turning it into a [`ResourceBuilder`], applying edits, and
//! building a new value; the original is never mutated.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// An immutable FHIR resource document.
///
/// # Examples
///
/// ```
/// use helios_merge::types::Resource;
/// use serde_json::json;
///
/// let resource = Resource::from_json(json!({
///     "resourceType": "Observation",
///     "id": "obs-1",
///     "subject": {"reference": "Patient/12345"}
/// }))
/// .unwrap();
///
/// assert_eq!(resource.resource_type(), "Observation");
/// assert_eq!(resource.id(), Some("obs-1"));
/// assert_eq!(resource.references()[0].to_string(), "Patient/12345");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource {
    resource_type: String,
    content: Value,
}

impl Resource {
    /// Parses a resource from its JSON form.
    ///
    /// Numeric ids are normalized to strings.
    pub fn from_json(mut content: Value) -> Result<Self, ValidationError> {
        let object = content
            .as_object_mut()
            .ok_or_else(|| ValidationError::InvalidResource {
                message: "resource must be a JSON object".to_string(),
            })?;

        let resource_type = match object.get("resourceType") {
            Some(Value::String(t)) if !t.is_empty() => t.clone(),
            Some(_) => {
                return Err(ValidationError::InvalidResource {
                    message: "resourceType must be a non-empty string".to_string(),
                });
            }
            None => return Err(ValidationError::MissingResourceType),
        };

        if let Some(Value::Number(n)) = object.get("id") {
            let id = n.to_string();
            object.insert("id".to_string(), Value::String(id));
        }

        Ok(Self {
            resource_type,
            content,
        })
    }

    /// Returns the FHIR resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the logical id, if present and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.content
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Returns the JSON content.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes the resource and returns its JSON content.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Looks up a value by JSON pointer (e.g. `/subject/reference`).
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.content.pointer(pointer)
    }

    /// Returns `meta.source`.
    pub fn source(&self) -> Option<&str> {
        self.pointer("/meta/source").and_then(Value::as_str)
    }

    /// Returns the code of the first `meta.security` tag with the given system.
    pub fn security_tag(&self, system: &str) -> Option<&str> {
        self.pointer("/meta/security")
            .and_then(Value::as_array)?
            .iter()
            .find(|tag| tag.get("system").and_then(Value::as_str) == Some(system))
            .and_then(|tag| tag.get("code"))
            .and_then(Value::as_str)
    }

    /// Returns the value of the first identifier with the given system.
    pub fn identifier(&self, system: &str) -> Option<&str> {
        self.content
            .get("identifier")
            .and_then(Value::as_array)?
            .iter()
            .find(|i| i.get("system").and_then(Value::as_str) == Some(system))
            .and_then(|i| i.get("value"))
            .and_then(Value::as_str)
    }

    /// Collects every `{"reference": "Type/id"}` in the document.
    pub fn references(&self) -> Vec<Reference> {
        let mut out = Vec::new();
        collect_references(&self.content, &mut out);
        out
    }

    /// Starts a builder seeded with this resource.
    pub fn to_builder(&self) -> ResourceBuilder {
        ResourceBuilder::from_resource(self.clone())
    }
}

impl TryFrom<Value> for Resource {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Resource::from_json(value)
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        resource.content
    }
}

fn collect_references(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::Object(map) => {
            if let Some(reference) = map
                .get("reference")
                .and_then(Value::as_str)
                .and_then(Reference::parse)
            {
                out.push(reference);
            }
            for child in map.values() {
                collect_references(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

/// A literal reference to another resource (`Type/id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Target resource type.
    pub resource_type: String,
    /// Target logical id.
    pub id: String,
}

impl Reference {
    /// Parses `Type/id`, `Type/id/_history/n`, or an absolute URL ending in either.
    pub fn parse(reference: &str) -> Option<Self> {
        let trimmed = match reference.find("/_history/") {
            Some(idx) => &reference[..idx],
            None => reference,
        };
        let mut parts = trimmed.rsplitn(2, '/');
        let id = parts.next()?;
        let rest = parts.next()?;
        let resource_type = rest.rsplit('/').next()?;
        let starts_upper = resource_type
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase());
        if id.is_empty() || !starts_upper {
            return None;
        }
        Some(Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// Builder that produces a new [`Resource`] from edits.
#[derive(Debug, Clone)]
pub struct ResourceBuilder {
    resource_type: String,
    content: Map<String, Value>,
}

impl ResourceBuilder {
    /// Creates a builder for an empty resource of the given type.
    pub fn new(resource_type: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let mut content = Map::new();
        content.insert(
            "resourceType".to_string(),
            Value::String(resource_type.clone()),
        );
        Self {
            resource_type,
            content,
        }
    }

    fn from_resource(resource: Resource) -> Self {
        let content = match resource.content {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            resource_type: resource.resource_type,
            content,
        }
    }

    /// Sets the logical id.
    pub fn id(self, id: impl Into<String>) -> Self {
        self.field("id", Value::String(id.into()))
    }

    /// Sets a top-level field.
    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.content.insert(name.into(), value);
        self
    }

    /// Sets the value at a JSON pointer, creating intermediate objects.
    pub fn pointer(mut self, pointer: &str, value: Value) -> Self {
        let mut root = Value::Object(std::mem::take(&mut self.content));
        set_pointer(&mut root, pointer, value);
        if let Value::Object(map) = root {
            self.content = map;
        }
        self
    }

    /// Removes the value at a JSON pointer, if present.
    pub fn remove(mut self, pointer: &str) -> Self {
        let mut root = Value::Object(std::mem::take(&mut self.content));
        remove_pointer(&mut root, pointer);
        if let Value::Object(map) = root {
            self.content = map;
        }
        self
    }

    /// Sets `meta.versionId`.
    pub fn version(self, version: u64) -> Self {
        self.pointer("/meta/versionId", Value::String(version.to_string()))
    }

    /// Sets `meta.lastUpdated`.
    pub fn last_updated(self, at: DateTime<Utc>) -> Self {
        self.pointer(
            "/meta/lastUpdated",
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        )
    }

    /// Sets the `meta.security` tag for `system`, replacing any existing tag with that system.
    pub fn security_tag(mut self, system: &str, code: impl Into<String>) -> Self {
        let tag = serde_json::json!({"system": system, "code": code.into()});
        let meta = self
            .content
            .entry("meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Some(meta) = meta.as_object_mut() {
            let security = meta
                .entry("security")
                .or_insert_with(|| Value::Array(Vec::new()));
            if !security.is_array() {
                *security = Value::Array(Vec::new());
            }
            if let Some(tags) = security.as_array_mut() {
                tags.retain(|t| t.get("system").and_then(Value::as_str) != Some(system));
                tags.push(tag);
            }
        }
        self
    }

    /// Adds an identifier unless one with the same system already exists.
    pub fn identifier(mut self, system: &str, value: impl Into<String>) -> Self {
        let identifiers = self
            .content
            .entry("identifier")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !identifiers.is_array() {
            *identifiers = Value::Array(Vec::new());
        }
        if let Some(items) = identifiers.as_array_mut() {
            let present = items
                .iter()
                .any(|i| i.get("system").and_then(Value::as_str) == Some(system));
            if !present {
                items.push(serde_json::json!({"system": system, "value": value.into()}));
            }
        }
        self
    }

    /// Builds the resource.
    pub fn build(mut self) -> Resource {
        self.content.insert(
            "resourceType".to_string(),
            Value::String(self.resource_type.clone()),
        );
        Resource {
            resource_type: self.resource_type,
            content: Value::Object(self.content),
        }
    }
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

pub(crate) fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let tokens: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(unescape)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        *root = value;
        return;
    };
    let mut current = root;
    for token in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.clone(), value);
    }
}

pub(crate) fn remove_pointer(root: &mut Value, pointer: &str) {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return;
    };
    let last = unescape(last);
    let target = if parent.is_empty() {
        Some(root)
    } else {
        root.pointer_mut(parent)
    };
    if let Some(Value::Object(map)) = target {
        map.remove(&last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_requires_resource_type() {
        let err = Resource::from_json(json!({"id": "1"})).unwrap_err();
        assert_eq!(err, ValidationError::MissingResourceType);

        let err = Resource::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidResource { .. }));
    }

    #[test]
    fn test_numeric_id_is_normalized() {
        let resource = Resource::from_json(json!({"resourceType": "Patient", "id": 42})).unwrap();
        assert_eq!(resource.id(), Some("42"));
    }

    #[test]
    fn test_builder_does_not_touch_original() {
        let original = Resource::from_json(json!({
            "resourceType": "Patient",
            "id": "p1",
            "active": true
        }))
        .unwrap();

        let changed = original
            .to_builder()
            .field("active", json!(false))
            .version(3)
            .build();

        assert_eq!(original.content()["active"], json!(true));
        assert_eq!(changed.content()["active"], json!(false));
        assert_eq!(changed.pointer("/meta/versionId"), Some(&json!("3")));
    }

    #[test]
    fn test_security_tag_replaces_same_system() {
        let resource = ResourceBuilder::new("Patient")
            .security_tag("https://example.org/owner", "A")
            .security_tag("https://example.org/access", "X")
            .security_tag("https://example.org/owner", "B")
            .build();

        assert_eq!(resource.security_tag("https://example.org/owner"), Some("B"));
        assert_eq!(resource.security_tag("https://example.org/access"), Some("X"));
        assert_eq!(
            resource.pointer("/meta/security").unwrap().as_array().unwrap().len(),
            2
        );
    }

    #[test]
    fn test_identifier_added_once() {
        let resource = ResourceBuilder::new("Patient")
            .identifier("urn:sys", "1")
            .identifier("urn:sys", "2")
            .build();
        assert_eq!(resource.identifier("urn:sys"), Some("1"));
    }

    #[test]
    fn test_remove_pointer() {
        let resource = ResourceBuilder::new("Patient")
            .pointer("/meta/versionId", json!("2"))
            .pointer("/meta/source", json!("client"))
            .remove("/meta/versionId")
            .build();
        assert!(resource.pointer("/meta/versionId").is_none());
        assert_eq!(resource.source(), Some("client"));
    }

    #[test]
    fn test_reference_parse() {
        assert_eq!(
            Reference::parse("Patient/123").unwrap().to_string(),
            "Patient/123"
        );
        assert_eq!(
            Reference::parse("http://x/fhir/Patient/123/_history/2")
                .unwrap()
                .to_string(),
            "Patient/123"
        );
        assert!(Reference::parse("urn:uuid:abc").is_none());
        assert!(Reference::parse("#contained").is_none());
    }

    #[test]
    fn test_references_are_collected_recursively() {
        let resource = Resource::from_json(json!({
            "resourceType": "Encounter",
            "subject": {"reference": "Patient/1"},
            "participant": [
                {"individual": {"reference": "Practitioner/7"}},
                {"individual": {"display": "no reference"}}
            ]
        }))
        .unwrap();

        let refs: Vec<String> = resource.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&"Patient/1".to_string()));
        assert!(refs.contains(&"Practitioner/7".to_string()));
    }
}
