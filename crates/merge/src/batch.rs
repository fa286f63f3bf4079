//! Request-scoped batch execution.
//!
//! A [`BatchJob`] holds the request's payload slots: [`PendingWrite`]s and
//! outcomes already decided (e.g. a rejection). A pending write covers every
//! payload submitted for one identity, folded into one net decision, so each
//! identity is written at most once per request. The [`BatchExecutor`]
//! splits the writes into units that can run concurrently:
//!
//! - per resource type, the writes whose identity appears once go out as a
//!   single bulk compare-and-swap; items the bulk call reports as mismatched
//!   fall back to the [`ConcurrencyWriter`]
//! - writes pushed separately for the same identity form a chain, applied in
//!   order, each re-validated against the version the previous one produced
//!
//! Outcomes come back one per payload, in input order; the payloads of a
//! folded write all share its outcome. Post-commit tasks
//! for each written item are queued as soon as its commit returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::{BoxFuture, join_all};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{MergeError, MergeResult};
use crate::identity::Identity;
use crate::merge::Decision;
use crate::postcommit::{
    AuditEventTask, ChangeEvent, ChangeEventTask, ChangeKind, PostCommitProcessor,
};
use crate::store::ResourceStore;
use crate::types::{CasOutcome, CasWrite, MergeOutcome, MergeStatus, Resource};
use crate::writer::{CommitStatus, ConcurrencyWriter};

/// Buffer of the streaming outcome channel.
const STREAM_BUFFER: usize = 64;

/// Accepted payloads for one identity waiting to be written.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Positions of the payloads in the request, in submission order.
    pub indexes: Vec<usize>,
    /// Resolved identity.
    pub identity: Identity,
    /// The payloads as submitted, in the same order as `indexes`.
    pub resources: Vec<Resource>,
    /// The net decision made against the version read before execution.
    pub decision: Decision,
}

impl PendingWrite {
    /// A write for a single payload.
    pub fn single(index: usize, identity: Identity, resource: Resource, decision: Decision) -> Self {
        Self {
            indexes: vec![index],
            identity,
            resources: vec![resource],
            decision,
        }
    }

    /// A write for several payloads of one identity, with their folded decision.
    pub fn folded(identity: Identity, items: Vec<(usize, Resource)>, decision: Decision) -> Self {
        let (indexes, resources) = items.into_iter().unzip();
        Self {
            indexes,
            identity,
            resources,
            decision,
        }
    }

    fn outcomes(&self, outcome: MergeOutcome) -> Vec<(usize, MergeOutcome)> {
        self.indexes.iter().map(|&index| (index, outcome.clone())).collect()
    }
}

/// All work of one request, in submission order.
#[derive(Debug, Clone)]
pub struct BatchJob {
    writes: Vec<PendingWrite>,
    decided: Vec<(usize, MergeOutcome)>,
}

impl BatchJob {
    /// Creates an empty job.
    pub fn new() -> Self {
        Self {
            writes: Vec::new(),
            decided: Vec::new(),
        }
    }

    /// Adds a write.
    pub fn push_write(&mut self, write: PendingWrite) {
        self.writes.push(write);
    }

    /// Adds an outcome decided before execution.
    pub fn push_outcome(&mut self, index: usize, outcome: MergeOutcome) {
        self.decided.push((index, outcome));
    }

    /// Returns the number of payload slots.
    pub fn len(&self) -> usize {
        self.writes.iter().map(|w| w.indexes.len()).sum::<usize>() + self.decided.len()
    }

    /// Returns `true` if the job has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the pending writes.
    pub fn writes(&self) -> &[PendingWrite] {
        &self.writes
    }

    fn into_units(self) -> Vec<Unit> {
        let mut occurrences: HashMap<(String, Uuid), usize> = HashMap::new();
        for write in &self.writes {
            *occurrences.entry(key(&write.identity)).or_default() += 1;
        }

        let mut bulk: BTreeMap<String, Vec<PendingWrite>> = BTreeMap::new();
        let mut chains: Vec<Vec<PendingWrite>> = Vec::new();
        let mut chain_index: HashMap<(String, Uuid), usize> = HashMap::new();

        for write in self.writes {
            let k = key(&write.identity);
            if occurrences.get(&k).copied().unwrap_or(0) > 1 {
                let slot = *chain_index.entry(k).or_insert_with(|| {
                    chains.push(Vec::new());
                    chains.len() - 1
                });
                chains[slot].push(write);
            } else {
                bulk.entry(write.identity.resource_type.clone())
                    .or_default()
                    .push(write);
            }
        }

        let mut units: Vec<Unit> = Vec::new();
        if !self.decided.is_empty() {
            units.push(Unit::Decided(self.decided));
        }
        units.extend(bulk.into_values().map(Unit::Bulk));
        units.extend(chains.into_iter().map(Unit::Chain));
        units
    }
}

impl Default for BatchJob {
    fn default() -> Self {
        Self::new()
    }
}

fn key(identity: &Identity) -> (String, Uuid) {
    (identity.resource_type.clone(), identity.surrogate_id)
}

enum Unit {
    Decided(Vec<(usize, MergeOutcome)>),
    Bulk(Vec<PendingWrite>),
    Chain(Vec<PendingWrite>),
}

/// Executes [`BatchJob`]s against a store.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    store: Arc<dyn ResourceStore>,
    writer: ConcurrencyWriter,
    processor: PostCommitProcessor,
    audit_events: bool,
    changes: Option<broadcast::Sender<ChangeEvent>>,
}

impl BatchExecutor {
    /// Creates an executor that queues audit events for every write.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        writer: ConcurrencyWriter,
        processor: PostCommitProcessor,
    ) -> Self {
        Self {
            store,
            writer,
            processor,
            audit_events: true,
            changes: None,
        }
    }

    /// Enables or disables audit event tasks.
    pub fn with_audit_events(mut self, enabled: bool) -> Self {
        self.audit_events = enabled;
        self
    }

    /// Publishes a change event for every write on `sender`.
    pub fn with_change_events(mut self, sender: broadcast::Sender<ChangeEvent>) -> Self {
        self.changes = Some(sender);
        self
    }

    /// Returns the post-commit processor tasks are queued on.
    pub fn processor(&self) -> &PostCommitProcessor {
        &self.processor
    }

    /// Executes a job and returns one outcome per payload, in input order.
    ///
    /// Item failures become rejected outcomes. The whole batch fails with
    /// [`MergeError::BatchAborted`] only if the store is unavailable before
    /// anything is written.
    pub async fn execute(&self, ctx: &RequestContext, job: BatchJob) -> MergeResult<Vec<MergeOutcome>> {
        self.ensure_available().await?;
        let total = job.len();

        let units = job.into_units();
        let mut results: Vec<(usize, MergeOutcome)> = join_all(
            units.into_iter().map(|unit| self.run_unit(ctx, unit)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();
        results.sort_by_key(|(index, _)| *index);

        let outcomes: Vec<MergeOutcome> = results.into_iter().map(|(_, o)| o).collect();
        log_summary(ctx, total, &outcomes);
        Ok(outcomes)
    }

    /// Executes a job, yielding each outcome with its payload index as soon
    /// as the unit it belongs to finishes.
    pub async fn execute_streaming(
        &self,
        ctx: &RequestContext,
        job: BatchJob,
    ) -> MergeResult<impl Stream<Item = (usize, MergeOutcome)> + Send + 'static> {
        self.ensure_available().await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let units = job.into_units();
        let this = self.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let mut running: FuturesUnordered<BoxFuture<'_, Vec<(usize, MergeOutcome)>>> =
                units
                    .into_iter()
                    .map(|unit| Box::pin(this.run_unit(&ctx, unit)) as BoxFuture<'_, _>)
                    .collect();

            while let Some(outcomes) = running.next().await {
                for item in outcomes {
                    if tx.send(item).await.is_err() {
                        debug!(
                            request_id = ctx.request_id(),
                            "Outcome receiver dropped, continuing without streaming"
                        );
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn ensure_available(&self) -> MergeResult<()> {
        self.store.health_check().await.map_err(|err| {
            warn!(backend = self.store.backend_name(), error = %err, "Aborting batch");
            MergeError::BatchAborted {
                reason: err.to_string(),
            }
        })
    }

    async fn run_unit(&self, ctx: &RequestContext, unit: Unit) -> Vec<(usize, MergeOutcome)> {
        match unit {
            Unit::Decided(outcomes) => outcomes,
            Unit::Bulk(writes) => self.run_bulk(ctx, writes).await,
            Unit::Chain(writes) => self.run_chain(ctx, writes).await,
        }
    }

    async fn run_bulk(&self, ctx: &RequestContext, writes: Vec<PendingWrite>) -> Vec<(usize, MergeOutcome)> {
        let mut out = Vec::with_capacity(writes.len());
        let mut cas = Vec::new();
        let mut sent = Vec::new();

        for write in writes {
            let (expected, content) = match &write.decision {
                Decision::Create(content) => (0, content.clone()),
                Decision::Update {
                    expected_version,
                    content,
                } => (*expected_version, content.clone()),
                Decision::Unchanged { version } => {
                    out.extend(write.outcomes(MergeOutcome::for_identity(
                        &write.identity,
                        MergeStatus::Unchanged,
                        Some(*version),
                    )));
                    continue;
                }
                Decision::Reject(rejection) => {
                    out.extend(write.outcomes(MergeOutcome::rejected_identity(
                        &write.identity,
                        rejection.clone(),
                    )));
                    continue;
                }
            };
            cas.push(CasWrite {
                identity: write.identity.clone(),
                expected_version: expected,
                content,
                request_id: ctx.request_id().to_string(),
            });
            sent.push(write);
        }

        if sent.is_empty() {
            return out;
        }

        let mut fallback = Vec::new();
        match self.store.bulk_compare_and_swap(cas).await {
            Ok(results) => {
                for (write, result) in sent.into_iter().zip(results) {
                    match result {
                        CasOutcome::Applied(version) => {
                            let status = if matches!(write.decision, Decision::Create(_)) {
                                MergeStatus::Created
                            } else {
                                MergeStatus::Updated
                            };
                            self.schedule(ctx, &write.identity, version.version, &status);
                            out.extend(write.outcomes(MergeOutcome::for_identity(
                                &write.identity,
                                status,
                                Some(version.version),
                            )));
                        }
                        CasOutcome::Mismatch { .. } => fallback.push(write),
                    }
                }
            }
            Err(err) => {
                warn!(
                    request_id = ctx.request_id(),
                    error = %err,
                    items = sent.len(),
                    "Bulk write failed, falling back to single writes"
                );
                fallback = sent;
            }
        }

        if !fallback.is_empty() {
            debug!(
                request_id = ctx.request_id(),
                items = fallback.len(),
                "Re-validating items after bulk mismatch"
            );
            let retried = join_all(fallback.iter().map(|write| self.apply_one(ctx, write))).await;
            out.extend(retried.into_iter().flatten());
        }
        out
    }

    async fn run_chain(&self, ctx: &RequestContext, writes: Vec<PendingWrite>) -> Vec<(usize, MergeOutcome)> {
        let mut out = Vec::with_capacity(writes.len());
        for write in &writes {
            if let Decision::Reject(rejection) = &write.decision {
                out.extend(write.outcomes(MergeOutcome::rejected_identity(
                    &write.identity,
                    rejection.clone(),
                )));
                continue;
            }
            out.extend(self.apply_one(ctx, write).await);
        }
        out
    }

    async fn apply_one(&self, ctx: &RequestContext, write: &PendingWrite) -> Vec<(usize, MergeOutcome)> {
        let outcome = match self
            .writer
            .apply_folded(ctx, &write.identity, &write.resources)
            .await
        {
            Ok(result) => {
                let status = match result.status {
                    CommitStatus::Created => MergeStatus::Created,
                    CommitStatus::Updated => MergeStatus::Updated,
                    CommitStatus::Unchanged => MergeStatus::Unchanged,
                };
                if let Some(version) = result.applied_version {
                    self.schedule(ctx, &write.identity, version, &status);
                }
                MergeOutcome::for_identity(&write.identity, status, result.applied_version)
            }
            Err(err) => {
                debug!(
                    request_id = ctx.request_id(),
                    resource_type = %write.identity.resource_type,
                    surrogate_id = %write.identity.surrogate_id,
                    error = %err,
                    "Item rejected"
                );
                MergeOutcome::rejected_identity(&write.identity, err.to_rejection())
            }
        };
        write.outcomes(outcome)
    }

    fn schedule(&self, ctx: &RequestContext, identity: &Identity, version: u64, status: &MergeStatus) {
        let kind = match status {
            MergeStatus::Created => ChangeKind::Created,
            MergeStatus::Updated => ChangeKind::Updated,
            MergeStatus::Unchanged | MergeStatus::Rejected(_) => return,
        };

        if self.audit_events && identity.resource_type != "AuditEvent" {
            self.processor.enqueue(
                ctx.request_id(),
                Box::new(AuditEventTask::new(
                    self.store.clone(),
                    identity.clone(),
                    version,
                    ctx.request_id(),
                    ctx.user_id().map(str::to_string),
                )),
            );
        }

        if let Some(sender) = &self.changes {
            self.processor.enqueue(
                ctx.request_id(),
                Box::new(ChangeEventTask::new(
                    sender.clone(),
                    ChangeEvent {
                        request_id: ctx.request_id().to_string(),
                        resource_type: identity.resource_type.clone(),
                        logical_id: identity.logical_id.clone(),
                        surrogate_id: identity.surrogate_id,
                        version,
                        kind,
                        timestamp: chrono::Utc::now(),
                    },
                )),
            );
        }
    }
}

fn log_summary(ctx: &RequestContext, total: usize, outcomes: &[MergeOutcome]) {
    let created = outcomes.iter().filter(|o| o.created()).count();
    let updated = outcomes.iter().filter(|o| o.updated()).count();
    let rejected = outcomes.iter().filter(|o| o.rejection().is_some()).count();
    info!(
        request_id = ctx.request_id(),
        total,
        created,
        updated,
        unchanged = total - created - updated - rejected,
        rejected,
        "Batch executed"
    );
}
