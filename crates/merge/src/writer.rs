//! Optimistic-concurrency commits.
//!
//! [`ConcurrencyWriter`] applies one accepted change with compare-and-swap.
//! When another writer got there first, it re-reads the winner's version,
//! re-decides the original payload against it, and tries again with the new
//! expected version. Two identical merges racing therefore converge: one is
//! applied, the other observes no net change and reports unchanged.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::context::RequestContext;
use crate::error::{MergeError, MergeResult, StorageError};
use crate::identity::Identity;
use crate::merge::{Decision, FoldResult, MergeValidator};
use crate::store::ResourceStore;
use crate::types::{CasOutcome, CasWrite, Resource, StoredVersion};

/// Delay between retries.
pub trait Backoff: Send + Sync + Debug {
    /// Returns how long to wait before retry number `attempt` (starting at 1).
    fn delay(&self, attempt: u32) -> Duration;
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Creates a backoff from a retry policy.
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self {
            initial: policy.initial_delay,
            max: policy.max_delay,
            multiplier: policy.backoff_multiplier,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

/// What a commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Inserted version 1.
    Created,
    /// Replaced the current version.
    Updated,
    /// Nothing needed writing.
    Unchanged,
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitResult {
    /// The version stored after the commit.
    pub applied_version: Option<u64>,
    /// What the commit did.
    pub status: CommitStatus,
}

impl CommitResult {
    fn applied(version: &StoredVersion, expected: u64) -> Self {
        Self {
            applied_version: Some(version.version),
            status: if expected == 0 {
                CommitStatus::Created
            } else {
                CommitStatus::Updated
            },
        }
    }

    fn unchanged(version: u64) -> Self {
        Self {
            applied_version: Some(version),
            status: CommitStatus::Unchanged,
        }
    }
}

/// Commits single-resource changes with compare-and-swap and bounded retry.
#[derive(Debug, Clone)]
pub struct ConcurrencyWriter {
    store: Arc<dyn ResourceStore>,
    validator: Arc<MergeValidator>,
    policy: RetryPolicy,
    backoff: Arc<dyn Backoff>,
}

impl ConcurrencyWriter {
    /// Creates a writer using exponential backoff from `policy`.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        validator: Arc<MergeValidator>,
        policy: RetryPolicy,
    ) -> Self {
        let backoff = Arc::new(ExponentialBackoff::from_policy(&policy));
        Self {
            store,
            validator,
            policy,
            backoff,
        }
    }

    /// Replaces the backoff strategy.
    pub fn with_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Reads the current version, decides, and commits.
    ///
    /// Used when the expected version is not known up front.
    pub async fn apply(
        &self,
        ctx: &RequestContext,
        identity: &Identity,
        incoming: &Resource,
    ) -> MergeResult<CommitResult> {
        self.apply_folded(ctx, identity, std::slice::from_ref(incoming))
            .await
    }

    /// Like [`apply`](Self::apply), for several submissions of one identity.
    ///
    /// The submissions are folded in order into one net change, which is
    /// committed as a single version.
    pub async fn apply_folded(
        &self,
        ctx: &RequestContext,
        identity: &Identity,
        items: &[Resource],
    ) -> MergeResult<CommitResult> {
        let current = self.read_current(identity).await?;
        match self.decide_all(items, identity, current.as_ref())? {
            Decision::Create(content) => self.commit_folded(ctx, identity, 0, items, content).await,
            Decision::Update {
                expected_version,
                content,
            } => {
                self.commit_folded(ctx, identity, expected_version, items, content)
                    .await
            }
            Decision::Unchanged { version } => Ok(CommitResult::unchanged(version)),
            Decision::Reject(rejection) => Err(MergeError::Rejected(rejection)),
        }
    }

    /// Commits `content` if the stored version is still `expected_prior_version`.
    ///
    /// On a version mismatch the current version is re-read and `incoming`
    /// re-decided against it; the commit is retried with the new expected
    /// version up to `max_attempts` times.
    pub async fn commit(
        &self,
        ctx: &RequestContext,
        identity: &Identity,
        expected_prior_version: u64,
        incoming: &Resource,
        content: Value,
    ) -> MergeResult<CommitResult> {
        self.commit_folded(
            ctx,
            identity,
            expected_prior_version,
            std::slice::from_ref(incoming),
            content,
        )
        .await
    }

    /// Like [`commit`](Self::commit), re-folding all of `items` on a mismatch.
    pub async fn commit_folded(
        &self,
        ctx: &RequestContext,
        identity: &Identity,
        expected_prior_version: u64,
        items: &[Resource],
        content: Value,
    ) -> MergeResult<CommitResult> {
        let mut expected = expected_prior_version;
        let mut content = content;
        let mut attempts = 0u32;
        let mut faults = 0u32;

        loop {
            let write = CasWrite {
                identity: identity.clone(),
                expected_version: expected,
                content: content.clone(),
                request_id: ctx.request_id().to_string(),
            };

            let outcome = match self.store.compare_and_swap(write).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    faults += 1;
                    self.fault_or_retry(identity, err, faults).await?;
                    continue;
                }
            };

            attempts += 1;
            let current_version = match outcome {
                CasOutcome::Applied(version) => {
                    debug!(
                        resource_type = %identity.resource_type,
                        surrogate_id = %identity.surrogate_id,
                        version = version.version,
                        attempt = attempts,
                        "Committed"
                    );
                    return Ok(CommitResult::applied(&version, expected));
                }
                CasOutcome::Mismatch { current_version } => current_version,
            };

            if attempts >= self.policy.max_attempts {
                warn!(
                    resource_type = %identity.resource_type,
                    surrogate_id = %identity.surrogate_id,
                    attempts,
                    "Version conflict retries exhausted"
                );
                return Err(MergeError::VersionConflict {
                    resource_type: identity.resource_type.clone(),
                    surrogate_id: identity.surrogate_id,
                    attempts,
                });
            }

            debug!(
                resource_type = %identity.resource_type,
                surrogate_id = %identity.surrogate_id,
                expected_version = expected,
                current_version = ?current_version,
                attempt = attempts,
                "Version mismatch, re-validating"
            );
            self.sleep(attempts).await;

            let current = self.read_current(identity).await?;
            match self.decide_all(items, identity, current.as_ref())? {
                Decision::Create(next) => {
                    expected = 0;
                    content = next;
                }
                Decision::Update {
                    expected_version,
                    content: next,
                } => {
                    expected = expected_version;
                    content = next;
                }
                Decision::Unchanged { version } => {
                    debug!(
                        resource_type = %identity.resource_type,
                        surrogate_id = %identity.surrogate_id,
                        version,
                        "Concurrent writer already applied this change"
                    );
                    return Ok(CommitResult::unchanged(version));
                }
                Decision::Reject(rejection) => return Err(MergeError::Rejected(rejection)),
            }
        }
    }

    fn decide_all(
        &self,
        items: &[Resource],
        identity: &Identity,
        current: Option<&StoredVersion>,
    ) -> MergeResult<Decision> {
        match items {
            [single] => self.validator.try_decide(single, identity, current),
            _ => match self.validator.fold(items, identity, current) {
                FoldResult::Accepted {
                    net: Decision::Reject(rejection),
                    ..
                }
                | FoldResult::Rejected(rejection) => Err(MergeError::Rejected(rejection)),
                FoldResult::Accepted { net, .. } => Ok(net),
            },
        }
    }

    async fn read_current(&self, identity: &Identity) -> MergeResult<Option<StoredVersion>> {
        let mut faults = 0u32;
        loop {
            match self
                .store
                .read_current(&identity.resource_type, identity.surrogate_id)
                .await
            {
                Ok(current) => return Ok(current),
                Err(err) => {
                    faults += 1;
                    self.fault_or_retry(identity, err, faults).await?;
                }
            }
        }
    }

    async fn fault_or_retry(
        &self,
        identity: &Identity,
        err: StorageError,
        faults: u32,
    ) -> MergeResult<()> {
        if faults > self.policy.write_retries {
            warn!(
                resource_type = %identity.resource_type,
                surrogate_id = %identity.surrogate_id,
                error = %err,
                "Store fault retries exhausted"
            );
            return Err(MergeError::Write(err));
        }
        debug!(
            resource_type = %identity.resource_type,
            surrogate_id = %identity.surrogate_id,
            error = %err,
            attempt = faults,
            "Store fault, retrying"
        );
        self.sleep(faults).await;
        Ok(())
    }

    async fn sleep(&self, attempt: u32) {
        let delay = self.backoff.delay(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
