//! Predefined FHIR resources for merge tests, with builders for variants.

use serde_json::{Value, json};

use helios_merge::identity::{OWNER_SYSTEM, SOURCE_ASSIGNING_AUTHORITY_SYSTEM};

/// Owning authority used by fixtures unless overridden.
pub const DEFAULT_OWNER: &str = "clinic";

/// A patient fixture.
#[derive(Debug, Clone)]
pub struct PatientFixture {
    /// Patient ID.
    pub id: String,
    /// Family name.
    pub family: String,
    /// Given names.
    pub given: Vec<String>,
    /// Owner tag code.
    pub owner: Option<String>,
    /// Source assigning authority tag code.
    pub source_authority: Option<String>,
    /// Identifiers (system, value).
    pub identifiers: Vec<(String, String)>,
    /// Gender.
    pub gender: Option<String>,
}

impl PatientFixture {
    /// Creates a patient owned by [`DEFAULT_OWNER`].
    pub fn new(id: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            family: family.into(),
            given: vec![],
            owner: Some(DEFAULT_OWNER.to_string()),
            source_authority: None,
            identifiers: vec![],
            gender: None,
        }
    }

    /// Sets given names.
    pub fn with_given(mut self, given: Vec<&str>) -> Self {
        self.given = given.into_iter().map(String::from).collect();
        self
    }

    /// Sets the owner tag; `None` removes it.
    pub fn with_owner(mut self, owner: Option<&str>) -> Self {
        self.owner = owner.map(String::from);
        self
    }

    /// Sets the source assigning authority tag.
    pub fn with_source_authority(mut self, authority: impl Into<String>) -> Self {
        self.source_authority = Some(authority.into());
        self
    }

    /// Adds an identifier.
    pub fn with_identifier(mut self, system: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.push((system.into(), value.into()));
        self
    }

    /// Sets gender.
    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.gender = Some(gender.into());
        self
    }

    /// Builds the JSON payload.
    pub fn build(&self) -> Value {
        let mut patient = json!({
            "resourceType": "Patient",
            "id": self.id,
            "name": [{ "family": self.family }]
        });
        if !self.given.is_empty() {
            patient["name"][0]["given"] = json!(self.given);
        }
        patient["meta"] = security(self.owner.as_deref(), self.source_authority.as_deref());
        if !self.identifiers.is_empty() {
            patient["identifier"] = self
                .identifiers
                .iter()
                .map(|(system, value)| json!({ "system": system, "value": value }))
                .collect();
        }
        if let Some(gender) = &self.gender {
            patient["gender"] = json!(gender);
        }
        patient
    }
}

/// An observation fixture.
#[derive(Debug, Clone)]
pub struct ObservationFixture {
    /// Observation ID.
    pub id: String,
    /// Subject reference (e.g. `Patient/12345`).
    pub subject: String,
    /// Status.
    pub status: String,
    /// Quantity value.
    pub value: Option<f64>,
    /// Owner tag code.
    pub owner: String,
}

impl ObservationFixture {
    /// Creates a final observation for `subject`.
    pub fn new(id: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            status: "final".to_string(),
            value: None,
            owner: DEFAULT_OWNER.to_string(),
        }
    }

    /// Sets the status.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Sets a quantity value in mmHg.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    /// Builds the JSON payload.
    pub fn build(&self) -> Value {
        let mut observation = json!({
            "resourceType": "Observation",
            "id": self.id,
            "meta": security(Some(&self.owner), None),
            "status": self.status,
            "code": { "coding": [{ "system": "http://loinc.org", "code": "8480-6" }] },
            "subject": { "reference": self.subject }
        });
        if let Some(value) = self.value {
            observation["valueQuantity"] = json!({ "value": value, "unit": "mmHg" });
        }
        observation
    }
}

fn security(owner: Option<&str>, source_authority: Option<&str>) -> Value {
    let mut tags = Vec::new();
    if let Some(owner) = owner {
        tags.push(json!({ "system": OWNER_SYSTEM, "code": owner }));
    }
    if let Some(authority) = source_authority {
        tags.push(json!({ "system": SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "code": authority }));
    }
    json!({ "security": tags })
}

/// A patient payload owned by [`DEFAULT_OWNER`].
pub fn patient(id: &str, family: &str) -> Value {
    PatientFixture::new(id, family).build()
}

/// An observation payload owned by [`DEFAULT_OWNER`].
pub fn observation(id: &str, subject: &str) -> Value {
    ObservationFixture::new(id, subject).build()
}
