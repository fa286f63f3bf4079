//! Engine constructors and store wrappers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use helios_merge::store::StoreKind;
use helios_merge::types::{CasOutcome, CasWrite, HistoryRecord, StoredVersion};
use helios_merge::{
    Identity, IdentityResolver, MemoryStore, MergeConfig, MergeEngine, Resource, ResourceStore,
    StorageResult,
};

/// Configuration with zero delays.
pub fn test_config() -> MergeConfig {
    MergeConfig::for_testing()
}

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    #[cfg(feature = "logging")]
    let _ = helios_merge::logging::try_init_logging("debug");
}

/// An engine over a fresh [`MemoryStore`], returned with the store.
pub fn memory_engine() -> (MergeEngine, Arc<MemoryStore>) {
    init_test_logging();
    let store = Arc::new(MemoryStore::new());
    (MergeEngine::new(test_config(), store.clone()), store)
}

/// Resolves the identity a payload will be stored under.
pub fn identity_of(payload: &Value) -> Identity {
    let resource = Resource::from_json(payload.clone()).expect("fixture is a resource");
    IdentityResolver::new()
        .resolve(&resource)
        .expect("fixture has an identity")
}

/// Reads the current version of a payload's resource.
pub async fn current_of(store: &dyn ResourceStore, payload: &Value) -> Option<StoredVersion> {
    let identity = identity_of(payload);
    store
        .read_current(&identity.resource_type, identity.surrogate_id)
        .await
        .expect("read current")
}

/// A store that lets an "external" writer win one race.
///
/// When armed for a surrogate id and expected version, the first
/// compare-and-swap matching both first applies a competing write (setting
/// `gender` to `female`) directly on the inner store, so the original swap
/// sees a version mismatch.
#[derive(Debug)]
pub struct RacingStore {
    inner: Arc<MemoryStore>,
    armed: AtomicBool,
    target: parking_lot::Mutex<Option<Uuid>>,
    at_expected: AtomicU64,
    injected: AtomicU64,
}

impl RacingStore {
    /// Wraps `inner` with no race armed.
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            target: parking_lot::Mutex::new(None),
            at_expected: AtomicU64::new(0),
            injected: AtomicU64::new(0),
        }
    }

    /// Arms one race for `surrogate_id`, triggered by the swap that expects `version`.
    pub fn arm(&self, surrogate_id: Uuid, version: u64) {
        *self.target.lock() = Some(surrogate_id);
        self.at_expected.store(version, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Number of external writes injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    async fn maybe_race(&self, write: &CasWrite) -> StorageResult<()> {
        let target = *self.target.lock();
        if target != Some(write.identity.surrogate_id)
            || write.expected_version != self.at_expected.load(Ordering::SeqCst)
            || !self.armed.swap(false, Ordering::SeqCst)
        {
            return Ok(());
        }

        let current = self
            .inner
            .read_current(&write.identity.resource_type, write.identity.surrogate_id)
            .await?;
        let (expected, mut content) = match current {
            Some(current) => (current.version, current.content),
            None => (0, write.content.clone()),
        };
        content["gender"] = json!("female");

        let outcome = self
            .inner
            .compare_and_swap(CasWrite {
                identity: write.identity.clone(),
                expected_version: expected,
                content,
                request_id: "external-writer".to_string(),
            })
            .await?;
        if outcome.is_applied() {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for RacingStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Custom("racing")
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }

    async fn read_current(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Option<StoredVersion>> {
        self.inner.read_current(resource_type, surrogate_id).await
    }

    async fn read_version(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
        version: u64,
    ) -> StorageResult<Option<StoredVersion>> {
        self.inner
            .read_version(resource_type, surrogate_id, version)
            .await
    }

    async fn compare_and_swap(&self, write: CasWrite) -> StorageResult<CasOutcome> {
        self.maybe_race(&write).await?;
        self.inner.compare_and_swap(write).await
    }

    async fn history(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Vec<HistoryRecord>> {
        self.inner.history(resource_type, surrogate_id).await
    }

    async fn history_since(
        &self,
        resource_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<HistoryRecord>> {
        self.inner.history_since(resource_type, since, limit).await
    }

    async fn count(&self, resource_type: &str) -> StorageResult<u64> {
        self.inner.count(resource_type).await
    }
}
