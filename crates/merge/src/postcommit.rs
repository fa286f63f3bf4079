//! Work that runs after a request's writes are committed.
//!
//! Tasks are queued per request id and only start when
//! [`PostCommitProcessor::execute`] is called, which the engine does after
//! the batch commit has returned. Each task gets a fixed number of attempts;
//! a task that keeps failing is logged and recorded, never retried forever.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//! use helios_merge::postcommit::{FnTask, PostCommitProcessor};
//!
//! let processor = PostCommitProcessor::new(3, Duration::ZERO);
//! let runs = Arc::new(AtomicUsize::new(0));
//!
//! let counter = runs.clone();
//! processor.enqueue("req-1", Box::new(FnTask::new("count", move || {
//!     let counter = counter.clone();
//!     async move {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!         Ok(())
//!     }
//! })));
//!
//! processor.execute("req-1");
//! processor.wait_till_done("req-1", Duration::from_secs(1)).await.unwrap();
//! assert_eq!(runs.load(Ordering::SeqCst), 1);
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{MergeError, MergeResult, StorageError};
use crate::identity::{Identity, OWNER_SYSTEM, SOURCE_ASSIGNING_AUTHORITY_SYSTEM, SURROGATE_NAMESPACE};
use crate::store::ResourceStore;
use crate::types::{CasOutcome, CasWrite, Resource, ResourceMethod};

/// Failure records kept for inspection across all requests.
const MAX_FAILURE_RECORDS: usize = 1024;

/// A unit of post-commit work.
#[async_trait]
pub trait DeferredTask: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Runs the task once.
    async fn run(&self) -> MergeResult<()>;
}

/// A task that gave up after its last attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    /// Request the task belonged to.
    pub request_id: String,
    /// Task name.
    pub name: String,
    /// Error from the final attempt.
    pub error: String,
    /// Attempts made.
    pub attempts: u32,
}

struct Group {
    queued: Vec<Box<dyn DeferredTask>>,
    pending: usize,
    notify: Arc<Notify>,
}

impl Group {
    fn new() -> Self {
        Self {
            queued: Vec::new(),
            pending: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Inner {
    groups: Mutex<HashMap<String, Group>>,
    failures: Mutex<VecDeque<FailedTask>>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Inner {
    fn finish(&self, request_id: &str) {
        let mut groups = self.groups.lock();
        let Some(group) = groups.get_mut(request_id) else {
            return;
        };
        group.pending = group.pending.saturating_sub(1);
        if group.pending == 0 && group.queued.is_empty() {
            if let Some(group) = groups.remove(request_id) {
                group.notify.notify_waiters();
            }
        }
    }

    fn record_failure(&self, failure: FailedTask) {
        let mut failures = self.failures.lock();
        if failures.len() == MAX_FAILURE_RECORDS {
            failures.pop_front();
        }
        failures.push_back(failure);
    }
}

/// Marks a task done when dropped, including when the task panics.
struct Completion {
    inner: Arc<Inner>,
    request_id: String,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.inner.finish(&self.request_id);
    }
}

/// Runs deferred tasks per request.
#[derive(Clone)]
pub struct PostCommitProcessor {
    inner: Arc<Inner>,
}

impl fmt::Debug for PostCommitProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostCommitProcessor")
            .field("max_attempts", &self.inner.max_attempts)
            .field("retry_delay", &self.inner.retry_delay)
            .field("requests", &self.active_requests())
            .finish()
    }
}

impl Default for PostCommitProcessor {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

impl PostCommitProcessor {
    /// Creates a processor giving each task `max_attempts` tries.
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                groups: Mutex::new(HashMap::new()),
                failures: Mutex::new(VecDeque::new()),
                max_attempts: max_attempts.max(1),
                retry_delay,
            }),
        }
    }

    /// Queues a task for a request. It does not run until [`execute`](Self::execute).
    pub fn enqueue(&self, request_id: &str, task: Box<dyn DeferredTask>) {
        let mut groups = self.inner.groups.lock();
        let group = groups
            .entry(request_id.to_string())
            .or_insert_with(Group::new);
        group.queued.push(task);
        group.pending += 1;
    }

    /// Starts every queued task for a request and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute(&self, request_id: &str) {
        let tasks = {
            let mut groups = self.inner.groups.lock();
            match groups.get_mut(request_id) {
                Some(group) => std::mem::take(&mut group.queued),
                None => return,
            }
        };

        debug!(request_id, tasks = tasks.len(), "Starting deferred tasks");
        for task in tasks {
            let completion = Completion {
                inner: self.inner.clone(),
                request_id: request_id.to_string(),
            };
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let completion = completion;
                run_with_attempts(&inner, &completion.request_id, task.as_ref()).await;
            });
        }
    }

    /// Returns the number of tasks queued or running for a request.
    pub fn pending(&self, request_id: &str) -> usize {
        self.inner
            .groups
            .lock()
            .get(request_id)
            .map(|g| g.pending)
            .unwrap_or(0)
    }

    /// Returns the number of requests with tasks queued or running.
    pub fn active_requests(&self) -> usize {
        self.inner.groups.lock().len()
    }

    /// Waits until every task of a request has finished.
    ///
    /// Fails with [`MergeError::DeferredTaskTimeout`] if tasks are still
    /// queued or running when `timeout` elapses. A request whose tasks have
    /// all finished is forgotten, so waiting on it returns immediately.
    pub async fn wait_till_done(&self, request_id: &str, timeout: Duration) -> MergeResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut groups = self.inner.groups.lock();
                match groups.get(request_id) {
                    None => return Ok(()),
                    Some(group) if group.pending == 0 => {
                        groups.remove(request_id);
                        return Ok(());
                    }
                    Some(group) => group.notify.clone(),
                }
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending(request_id) == 0 {
                continue;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let pending = self.pending(request_id);
                if pending == 0 {
                    continue;
                }
                warn!(request_id, pending, "Deferred tasks did not finish in time");
                return Err(MergeError::DeferredTaskTimeout {
                    request_id: request_id.to_string(),
                    pending,
                    timeout,
                });
            }
        }
    }

    /// Returns the recorded failures of a request.
    pub fn failed_tasks(&self, request_id: &str) -> Vec<FailedTask> {
        self.inner
            .failures
            .lock()
            .iter()
            .filter(|f| f.request_id == request_id)
            .cloned()
            .collect()
    }
}

async fn run_with_attempts(inner: &Inner, request_id: &str, task: &dyn DeferredTask) {
    let max_attempts = inner.max_attempts;
    for attempt in 1..=max_attempts {
        match task.run().await {
            Ok(()) => {
                debug!(request_id, task = task.name(), attempt, "Deferred task finished");
                return;
            }
            Err(err) if attempt < max_attempts => {
                warn!(
                    request_id,
                    task = task.name(),
                    attempt,
                    error = %err,
                    "Deferred task failed, retrying"
                );
                if !inner.retry_delay.is_zero() {
                    tokio::time::sleep(inner.retry_delay).await;
                }
            }
            Err(err) => {
                error!(
                    request_id,
                    task = task.name(),
                    attempts = attempt,
                    error = %err,
                    "Deferred task dropped"
                );
                inner.record_failure(FailedTask {
                    request_id: request_id.to_string(),
                    name: task.name().to_string(),
                    error: err.to_string(),
                    attempts: attempt,
                });
            }
        }
    }
}

/// Adapts an async closure into a [`DeferredTask`].
pub struct FnTask {
    name: String,
    f: Box<dyn Fn() -> BoxFuture<'static, MergeResult<()>> + Send + Sync>,
}

impl FnTask {
    /// Creates a task that calls `f` on every attempt.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MergeResult<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move || Box::pin(f())),
        }
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl DeferredTask for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> MergeResult<()> {
        (self.f)().await
    }
}

/// Records an `AuditEvent` for a committed write.
///
/// The event is keyed on the request and the versioned reference, so a
/// retried attempt finds its own earlier insert and succeeds.
#[derive(Debug, Clone)]
pub struct AuditEventTask {
    store: Arc<dyn ResourceStore>,
    identity: Identity,
    version: u64,
    request_id: String,
    user_id: Option<String>,
}

impl AuditEventTask {
    /// Creates an audit task for `identity` at `version`.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        identity: Identity,
        version: u64,
        request_id: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            store,
            identity,
            version,
            request_id: request_id.into(),
            user_id,
        }
    }

    fn event_identity(&self, what: &str) -> Identity {
        let key = format!("{}|{}", self.request_id, what);
        let id = Uuid::new_v5(&SURROGATE_NAMESPACE, key.as_bytes());
        Identity {
            resource_type: "AuditEvent".to_string(),
            logical_id: id.to_string(),
            surrogate_id: id,
            owning_authority: self.identity.owning_authority.clone(),
        }
    }
}

#[async_trait]
impl DeferredTask for AuditEventTask {
    fn name(&self) -> &str {
        "audit-event"
    }

    async fn run(&self) -> MergeResult<()> {
        let committed = self
            .store
            .read_version(
                &self.identity.resource_type,
                self.identity.surrogate_id,
                self.version,
            )
            .await?
            .ok_or_else(|| StorageError::Internal {
                backend_name: self.store.backend_name().to_string(),
                message: format!(
                    "{}/_history/{} is not visible",
                    self.identity.reference(),
                    self.version
                ),
                source: None,
            })?;

        let what = committed.versioned_reference();
        let event_identity = self.event_identity(&what);
        let method = ResourceMethod::for_version(self.version);
        let (action, interaction) = match method {
            ResourceMethod::Post => ("C", "create"),
            ResourceMethod::Put => ("U", "update"),
        };
        let agent = match &self.user_id {
            Some(user) => json!({"who": {"reference": user}, "requestor": true}),
            None => json!({"who": {"display": "anonymous"}, "requestor": true}),
        };

        let event = json!({
            "resourceType": "AuditEvent",
            "id": event_identity.logical_id,
            "meta": {
                "security": [
                    {"system": OWNER_SYSTEM, "code": self.identity.owning_authority},
                    {"system": SOURCE_ASSIGNING_AUTHORITY_SYSTEM, "code": self.identity.owning_authority}
                ]
            },
            "type": {
                "system": "http://terminology.hl7.org/CodeSystem/audit-event-type",
                "code": "rest"
            },
            "subtype": [{"system": "http://hl7.org/fhir/restful-interaction", "code": interaction}],
            "action": action,
            "recorded": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "agent": [agent],
            "source": {"observer": {"display": "helios-merge"}},
            "entity": [{"what": {"reference": what}}]
        });
        let event = event_identity
            .stamp(&Resource::from_json(event)?)
            .into_content();

        let outcome = self
            .store
            .compare_and_swap(CasWrite {
                identity: event_identity,
                expected_version: 0,
                content: event,
                request_id: self.request_id.clone(),
            })
            .await?;
        if let CasOutcome::Mismatch { .. } = outcome {
            debug!(what = %what, "Audit event already recorded");
        }
        Ok(())
    }
}

/// What kind of change a [`ChangeEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// The resource was created.
    Created,
    /// The resource got a new version.
    Updated,
}

/// Notification that a committed write is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Request that wrote the change.
    pub request_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Logical id.
    pub logical_id: String,
    /// Surrogate id.
    pub surrogate_id: Uuid,
    /// Version written.
    pub version: u64,
    /// Created or updated.
    pub kind: ChangeKind,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

/// Publishes a [`ChangeEvent`] to subscribers.
///
/// Having no subscribers is not a failure.
#[derive(Debug, Clone)]
pub struct ChangeEventTask {
    sender: broadcast::Sender<ChangeEvent>,
    event: ChangeEvent,
}

impl ChangeEventTask {
    /// Creates a task that sends `event` on `sender`.
    pub fn new(sender: broadcast::Sender<ChangeEvent>, event: ChangeEvent) -> Self {
        Self { sender, event }
    }
}

#[async_trait]
impl DeferredTask for ChangeEventTask {
    fn name(&self) -> &str {
        "change-event"
    }

    async fn run(&self) -> MergeResult<()> {
        if self.sender.send(self.event.clone()).is_err() {
            debug!(
                resource_type = %self.event.resource_type,
                logical_id = %self.event.logical_id,
                "No change event subscribers"
            );
        }
        Ok(())
    }
}
