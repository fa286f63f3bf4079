//! Request context for merge operations.
//!
//! Every merge runs under a [`RequestContext`]. The request id keys the
//! post-commit task queue and is written onto history records; the
//! principal and scopes feed the access evaluator.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Operations an access evaluator is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create a resource that does not exist yet.
    Create,
    /// Replace an existing resource.
    Update,
    /// Create-or-update via `$merge`.
    Merge,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Merge => write!(f, "merge"),
        }
    }
}

/// Who is asking, and under which request.
///
/// # Examples
///
/// ```
/// use helios_merge::context::RequestContext;
///
/// let ctx = RequestContext::new("req-42")
///     .with_user_id("practitioner-7")
///     .with_scopes(["user/Observation.write"]);
///
/// assert_eq!(ctx.request_id(), "req-42");
/// assert!(ctx.scopes().iter().any(|s| s == "user/Observation.write"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    user_id: Option<String>,
    scopes: Arc<Vec<String>>,
}

impl RequestContext {
    /// Creates a context for the given request id.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
            scopes: Arc::new(Vec::new()),
        }
    }

    /// Creates a context with a random request id.
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Sets the user id recorded for auditing.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Sets the granted scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Arc::new(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the user id, if set.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Returns the granted scopes.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}
