//! The `$merge` request driver.
//!
//! [`MergeEngine`] takes the payloads of one request through the whole
//! write path: parse, structure validation, identity resolution, access
//! check, merge decision against the current version, batch execution, and
//! finally the start of the request's post-commit work.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use helios_merge::{MemoryStore, MergeConfig, MergeEngine, RequestContext};
//! use serde_json::json;
//!
//! let engine = MergeEngine::new(MergeConfig::for_testing(), Arc::new(MemoryStore::new()));
//! let ctx = RequestContext::new("req-1");
//!
//! let payload = json!({
//!     "resourceType": "Patient",
//!     "id": "12345",
//!     "meta": { "security": [{ "system": "https://www.icanbwell.com/owner", "code": "clinic" }] },
//!     "name": [{ "family": "Smith" }]
//! });
//!
//! let outcomes = engine.merge(&ctx, vec![payload.clone()]).await.unwrap();
//! assert!(outcomes[0].created());
//!
//! let again = engine.merge(&RequestContext::new("req-2"), vec![payload]).await.unwrap();
//! assert!(!again[0].created() && !again[0].updated());
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{
    AccessDecision, AccessEvaluator, AllowAll, BasicStructureValidator, StructureValidator,
};
use crate::batch::{BatchExecutor, BatchJob, PendingWrite};
use crate::config::MergeConfig;
use crate::context::{Operation, RequestContext};
use crate::error::{MergeError, MergeResult, ValidationError};
use crate::identity::{Identity, IdentityResolver};
use crate::merge::{Decision, FoldResult, MergeValidator};
use crate::postcommit::{ChangeEvent, PostCommitProcessor};
use crate::store::ResourceStore;
use crate::types::{MergeOutcome, Rejection, Resource};
use crate::writer::ConcurrencyWriter;

/// Capacity of the change event channel.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Buffer of the streaming outcome channel.
const STREAM_BUFFER: usize = 64;

/// Splits a request body into payloads.
///
/// Accepts a single resource, a JSON array of resources, or a `Bundle`
/// whose `entry[].resource` items are merged. A bundle entry without a
/// resource still yields a payload slot so it gets its own (rejected)
/// outcome.
///
/// # Examples
///
/// ```
/// use helios_merge::engine::payloads_from_body;
/// use serde_json::json;
///
/// let bundle = json!({
///     "resourceType": "Bundle",
///     "entry": [
///         { "resource": { "resourceType": "Patient", "id": "1" } },
///         { "resource": { "resourceType": "Patient", "id": "2" } }
///     ]
/// });
/// assert_eq!(payloads_from_body(bundle).unwrap().len(), 2);
/// ```
pub fn payloads_from_body(body: Value) -> Result<Vec<Value>, ValidationError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => {
            if object.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
                return Ok(vec![Value::Object(object)]);
            }
            match object.remove("entry") {
                None => Ok(Vec::new()),
                Some(Value::Array(entries)) => Ok(entries
                    .into_iter()
                    .map(|mut entry| {
                        entry
                            .get_mut("resource")
                            .map(Value::take)
                            .unwrap_or(Value::Null)
                    })
                    .collect()),
                Some(_) => Err(ValidationError::InvalidResource {
                    message: "Bundle.entry must be an array".to_string(),
                }),
            }
        }
        _ => Err(ValidationError::InvalidResource {
            message: "request body must be a resource, an array of resources, or a Bundle"
                .to_string(),
        }),
    }
}

/// Drives `$merge` requests against a [`ResourceStore`].
#[derive(Debug, Clone)]
pub struct MergeEngine {
    config: MergeConfig,
    store: Arc<dyn ResourceStore>,
    resolver: IdentityResolver,
    validator: Arc<MergeValidator>,
    structure: Arc<dyn StructureValidator>,
    access: Arc<dyn AccessEvaluator>,
    executor: BatchExecutor,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MergeEngine {
    /// Creates an engine with [`BasicStructureValidator`] and [`AllowAll`].
    pub fn new(config: MergeConfig, store: Arc<dyn ResourceStore>) -> Self {
        let mut resolver = IdentityResolver::new().with_generated_ids(config.generate_missing_ids);
        if let Some(authority) = &config.default_authority {
            resolver = resolver.with_default_authority(authority.clone());
        }

        let validator = Arc::new(
            MergeValidator::new(config.immutability.clone()).with_mode(config.merge_mode),
        );
        let writer = ConcurrencyWriter::new(store.clone(), validator.clone(), config.retry.clone());
        let processor =
            PostCommitProcessor::new(config.deferred.max_attempts, config.deferred.retry_delay);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let executor = BatchExecutor::new(store.clone(), writer, processor)
            .with_audit_events(config.deferred.audit_events)
            .with_change_events(changes.clone());

        Self {
            config,
            store,
            resolver,
            validator,
            structure: Arc::new(BasicStructureValidator),
            access: Arc::new(AllowAll),
            executor,
            changes,
        }
    }

    /// Replaces the structure validator.
    pub fn with_structure_validator(mut self, validator: Arc<dyn StructureValidator>) -> Self {
        self.structure = validator;
        self
    }

    /// Replaces the access evaluator.
    pub fn with_access_evaluator(mut self, evaluator: Arc<dyn AccessEvaluator>) -> Self {
        self.access = evaluator;
        self
    }

    /// Returns the configuration the engine was built with.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Returns the post-commit processor.
    pub fn processor(&self) -> &PostCommitProcessor {
        self.executor.processor()
    }

    /// Subscribes to change events published after each write.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Merges `payloads` and returns one outcome per payload, in order.
    ///
    /// Post-commit tasks for the request are started before this returns;
    /// use [`wait_till_done`](Self::wait_till_done) to wait for them.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), payloads = payloads.len()))]
    pub async fn merge(&self, ctx: &RequestContext, payloads: Vec<Value>) -> MergeResult<Vec<MergeOutcome>> {
        let job = self.prepare(ctx, payloads).await?;
        let outcomes = self.executor.execute(ctx, job).await?;
        self.processor().execute(ctx.request_id());
        Ok(outcomes)
    }

    /// Splits `body` with [`payloads_from_body`] and merges the result.
    pub async fn merge_body(&self, ctx: &RequestContext, body: Value) -> MergeResult<Vec<MergeOutcome>> {
        let payloads = payloads_from_body(body)?;
        self.merge(ctx, payloads).await
    }

    /// Merges `payloads`, yielding `(index, outcome)` pairs as items finish.
    ///
    /// Outcomes arrive in completion order; the index is the payload's
    /// position in the request. Post-commit tasks start once every outcome
    /// has been produced, whether or not the stream is consumed.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id(), payloads = payloads.len()))]
    pub async fn merge_streaming(
        &self,
        ctx: &RequestContext,
        payloads: Vec<Value>,
    ) -> MergeResult<impl Stream<Item = (usize, MergeOutcome)> + Send + 'static> {
        let job = self.prepare(ctx, payloads).await?;
        let mut outcomes = Box::pin(self.executor.execute_streaming(ctx, job).await?);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let processor = self.processor().clone();
        let request_id = ctx.request_id().to_string();
        tokio::spawn(async move {
            let mut receiver_open = true;
            while let Some(item) = outcomes.next().await {
                if receiver_open && tx.send(item).await.is_err() {
                    receiver_open = false;
                }
            }
            processor.execute(&request_id);
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Waits for the request's post-commit tasks, up to the configured timeout.
    pub async fn wait_till_done(&self, request_id: &str) -> MergeResult<()> {
        self.processor()
            .wait_till_done(request_id, self.config.deferred.wait_timeout)
            .await
    }

    /// Resolves, authorizes and decides every payload, producing the job.
    async fn prepare(&self, ctx: &RequestContext, payloads: Vec<Value>) -> MergeResult<BatchJob> {
        let mut job = BatchJob::new();
        let mut groups: Vec<Group> = Vec::new();
        let mut group_index: HashMap<(String, Uuid), usize> = HashMap::new();

        for (index, payload) in payloads.into_iter().enumerate() {
            match self.admit(ctx, &payload).await {
                Ok((identity, resource)) => {
                    let key = (identity.resource_type.clone(), identity.surrogate_id);
                    let slot = *group_index.entry(key).or_insert_with(|| {
                        groups.push(Group {
                            identity: identity.clone(),
                            items: Vec::new(),
                        });
                        groups.len() - 1
                    });
                    groups[slot].items.push((index, resource));
                }
                Err(outcome) => job.push_outcome(index, outcome),
            }
        }

        for group in groups {
            self.decide_group(&mut job, group).await?;
        }

        debug!(
            request_id = ctx.request_id(),
            writes = job.writes().len(),
            "Prepared batch"
        );
        Ok(job)
    }

    async fn admit(&self, ctx: &RequestContext, payload: &Value) -> Result<(Identity, Resource), MergeOutcome> {
        let reject = |rejection: Rejection| MergeOutcome::rejected_payload(payload, rejection);

        let resource = Resource::from_json(payload.clone())
            .map_err(|err| reject(MergeError::from(err).to_rejection()))?;
        self.structure
            .validate_structure(&resource)
            .map_err(|err| reject(MergeError::from(err).to_rejection()))?;
        let identity = self
            .resolver
            .resolve(&resource)
            .map_err(|err| reject(MergeError::from(err).to_rejection()))?;

        match self.access.authorize(&identity, Operation::Merge, ctx).await {
            AccessDecision::Allow => Ok((identity, resource)),
            AccessDecision::Deny(reason) => {
                info!(
                    request_id = ctx.request_id(),
                    resource_type = %identity.resource_type,
                    reason = %reason,
                    "Merge denied"
                );
                let err = MergeError::AccessDenied { reason };
                Err(MergeOutcome::rejected_identity(&identity, err.to_rejection()))
            }
        }
    }

    async fn decide_group(&self, job: &mut BatchJob, group: Group) -> MergeResult<()> {
        let Group { identity, items } = group;

        let current = match self
            .store
            .read_current(&identity.resource_type, identity.surrogate_id)
            .await
        {
            Ok(current) => current,
            Err(err) if err.is_unavailable() => {
                warn!(error = %err, "Store unavailable while reading current versions");
                return Err(MergeError::BatchAborted {
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                let rejection = MergeError::Write(err).to_rejection();
                for (index, _) in items {
                    job.push_outcome(index, MergeOutcome::rejected_identity(&identity, rejection.clone()));
                }
                return Ok(());
            }
        };

        if let [(index, resource)] = items.as_slice() {
            let decision = self.validator.decide(resource, &identity, current.as_ref());
            job.push_write(PendingWrite::single(*index, identity, resource.clone(), decision));
            return Ok(());
        }

        let resources: Vec<Resource> = items.iter().map(|(_, r)| r.clone()).collect();
        let decision = match self.validator.fold(&resources, &identity, current.as_ref()) {
            FoldResult::Accepted { net, .. } => net,
            FoldResult::Rejected(rejection) => {
                debug!(
                    resource_type = %identity.resource_type,
                    surrogate_id = %identity.surrogate_id,
                    items = items.len(),
                    "Rejecting repeated submissions"
                );
                Decision::Reject(rejection)
            }
        };
        job.push_write(PendingWrite::folded(identity, items, decision));
        Ok(())
    }
}

struct Group {
    identity: Identity,
    items: Vec<(usize, Resource)>,
}
