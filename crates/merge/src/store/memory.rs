//! In-process store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::types::{CasOutcome, CasWrite, HistoryRecord, StoredVersion};

use super::{ResourceStore, StoreKind};

#[derive(Debug, Default)]
struct Collection {
    current: HashMap<Uuid, StoredVersion>,
    history: BTreeMap<(Uuid, u64), HistoryRecord>,
}

impl Collection {
    fn apply(&mut self, write: CasWrite, now: DateTime<Utc>) -> CasOutcome {
        let surrogate_id = write.identity.surrogate_id;
        let stored_version = self.current.get(&surrogate_id).map(|v| v.version);

        let matches = match (stored_version, write.expected_version) {
            (None, 0) => true,
            (Some(stored), expected) => stored == expected,
            (None, _) => false,
        };
        if !matches {
            return CasOutcome::Mismatch {
                current_version: stored_version,
            };
        }

        let next = StoredVersion::committed(
            write.identity,
            write.expected_version + 1,
            now,
            write.content,
        );
        if let Some(previous) = self.current.insert(surrogate_id, next.clone()) {
            let key = (surrogate_id, previous.version);
            self.history
                .insert(key, previous.supersede(write.request_id, now));
        }
        CasOutcome::Applied(next)
    }
}

/// A [`ResourceStore`] backed by in-process maps.
///
/// Locks guard only synchronous sections; nothing is held across an await.
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Marks the store as (un)available; health checks fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                backend_name: "memory".to_string(),
                message: "store marked unavailable".to_string(),
            })
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.ensure_available()
    }

    async fn read_current(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Option<StoredVersion>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        Ok(collections
            .get(resource_type)
            .and_then(|c| c.current.get(&surrogate_id))
            .cloned())
    }

    async fn read_version(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
        version: u64,
    ) -> StorageResult<Option<StoredVersion>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let Some(collection) = collections.get(resource_type) else {
            return Ok(None);
        };
        if let Some(current) = collection
            .current
            .get(&surrogate_id)
            .filter(|v| v.version == version)
        {
            return Ok(Some(current.clone()));
        }
        Ok(collection
            .history
            .get(&(surrogate_id, version))
            .map(|record| record.version.clone()))
    }

    async fn compare_and_swap(&self, write: CasWrite) -> StorageResult<CasOutcome> {
        self.ensure_available()?;
        let resource_type = write.identity.resource_type.clone();
        let surrogate_id = write.identity.surrogate_id;
        let expected = write.expected_version;

        let outcome = {
            let mut collections = self.collections.write();
            collections
                .entry(resource_type.clone())
                .or_default()
                .apply(write, Utc::now())
        };

        trace!(
            resource_type = %resource_type,
            surrogate_id = %surrogate_id,
            expected_version = expected,
            applied = outcome.is_applied(),
            "Compare-and-swap"
        );
        Ok(outcome)
    }

    async fn bulk_compare_and_swap(&self, writes: Vec<CasWrite>) -> StorageResult<Vec<CasOutcome>> {
        self.ensure_available()?;
        let count = writes.len();
        let now = Utc::now();
        let outcomes: Vec<CasOutcome> = {
            let mut collections = self.collections.write();
            writes
                .into_iter()
                .map(|write| {
                    collections
                        .entry(write.identity.resource_type.clone())
                        .or_default()
                        .apply(write, now)
                })
                .collect()
        };
        debug!(
            writes = count,
            applied = outcomes.iter().filter(|o| o.is_applied()).count(),
            "Bulk compare-and-swap"
        );
        Ok(outcomes)
    }

    async fn history(
        &self,
        resource_type: &str,
        surrogate_id: Uuid,
    ) -> StorageResult<Vec<HistoryRecord>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        Ok(collections
            .get(resource_type)
            .map(|c| {
                c.history
                    .range((surrogate_id, 0)..=(surrogate_id, u64::MAX))
                    .map(|(_, record)| record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn history_since(
        &self,
        resource_type: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> StorageResult<Vec<HistoryRecord>> {
        self.ensure_available()?;
        let collections = self.collections.read();
        let mut records: Vec<HistoryRecord> = collections
            .get(resource_type)
            .map(|c| {
                c.history
                    .values()
                    .filter(|r| r.version.last_modified >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| {
            b.version
                .last_modified
                .cmp(&a.version.last_modified)
                .then(b.version_number().cmp(&a.version_number()))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn count(&self, resource_type: &str) -> StorageResult<u64> {
        self.ensure_available()?;
        let collections = self.collections.read();
        Ok(collections
            .get(resource_type)
            .map(|c| c.current.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use serde_json::json;

    fn identity(id: &str) -> Identity {
        Identity {
            resource_type: "Patient".to_string(),
            logical_id: id.to_string(),
            surrogate_id: crate::identity::surrogate_id("Patient", id, "A"),
            owning_authority: "A".to_string(),
        }
    }

    fn write(identity: &Identity, expected: u64, active: bool) -> CasWrite {
        CasWrite {
            identity: identity.clone(),
            expected_version: expected,
            content: json!({"resourceType": "Patient", "id": identity.logical_id, "active": active}),
            request_id: "req".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_then_replace() {
        let store = MemoryStore::new();
        let id = identity("1");

        let CasOutcome::Applied(v1) = store.compare_and_swap(write(&id, 0, true)).await.unwrap()
        else {
            panic!("insert should apply");
        };
        assert_eq!(v1.version, 1);
        assert_eq!(v1.content["meta"]["versionId"], "1");

        let CasOutcome::Applied(v2) = store.compare_and_swap(write(&id, 1, false)).await.unwrap()
        else {
            panic!("replace should apply");
        };
        assert_eq!(v2.version, 2);

        let history = store.history("Patient", id.surrogate_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version_number(), 1);
        assert_eq!(history[0].version.content["active"], true);
    }

    #[tokio::test]
    async fn test_mismatch_leaves_state() {
        let store = MemoryStore::new();
        let id = identity("1");
        store.compare_and_swap(write(&id, 0, true)).await.unwrap();

        let outcome = store.compare_and_swap(write(&id, 0, false)).await.unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Mismatch {
                current_version: Some(1)
            }
        );
        let outcome = store.compare_and_swap(write(&id, 5, false)).await.unwrap();
        assert!(!outcome.is_applied());

        let missing = store
            .compare_and_swap(write(&identity("2"), 3, false))
            .await
            .unwrap();
        assert_eq!(missing, CasOutcome::Mismatch { current_version: None });

        let current = store
            .read_current("Patient", id.surrogate_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 1);
        assert!(store.history("Patient", id.surrogate_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_version_spans_history() {
        let store = MemoryStore::new();
        let id = identity("1");
        store.compare_and_swap(write(&id, 0, true)).await.unwrap();
        store.compare_and_swap(write(&id, 1, false)).await.unwrap();

        let v1 = store.read_version("Patient", id.surrogate_id, 1).await.unwrap().unwrap();
        let v2 = store.read_version("Patient", id.surrogate_id, 2).await.unwrap().unwrap();
        assert_eq!(v1.content["active"], true);
        assert_eq!(v2.content["active"], false);
        assert!(store.read_version("Patient", id.surrogate_id, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_outcomes_are_independent() {
        let store = MemoryStore::new();
        let a = identity("a");
        let b = identity("b");
        store.compare_and_swap(write(&b, 0, true)).await.unwrap();

        let outcomes = store
            .bulk_compare_and_swap(vec![write(&a, 0, true), write(&b, 0, true)])
            .await
            .unwrap();
        assert!(outcomes[0].is_applied());
        assert!(!outcomes[1].is_applied());
        assert_eq!(store.count("Patient").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.health_check().await.unwrap_err();
        assert!(err.is_unavailable());
        store.set_available(true);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_history_since_is_newest_first() {
        let store = MemoryStore::new();
        let id = identity("1");
        let start = Utc::now();
        for expected in 0..4 {
            store
                .compare_and_swap(write(&id, expected, expected % 2 == 0))
                .await
                .unwrap();
        }

        let records = store.history_since("Patient", start, 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].version_number(), 3);
        assert_eq!(records[1].version_number(), 2);
    }
}
