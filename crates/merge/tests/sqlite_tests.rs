//! The merge write path over the SQLite store.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;

use common::*;
use helios_merge::types::RejectionKind;
use helios_merge::{MergeEngine, RequestContext, ResourceStore, SqliteStore, SqliteStoreConfig};

fn sqlite_engine() -> (MergeEngine, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::in_memory().expect("in-memory sqlite"));
    (MergeEngine::new(test_config(), store.clone()), store)
}

#[tokio::test]
async fn test_create_update_unchanged() {
    let (engine, store) = sqlite_engine();
    let payload = patient("1", "Smith");

    let created = engine.merge(&RequestContext::new("r1"), vec![payload.clone()]).await.unwrap();
    assert!(created[0].created());

    let again = engine.merge(&RequestContext::new("r2"), vec![payload.clone()]).await.unwrap();
    assert!(!again[0].created() && !again[0].updated());

    let update = PatientFixture::new("1", "Smith").with_gender("male").build();
    let updated = engine.merge(&RequestContext::new("r3"), vec![update]).await.unwrap();
    assert!(updated[0].updated());
    assert_eq!(updated[0].version, Some(2));

    let identity = identity_of(&payload);
    let history = store.history("Patient", identity.surrogate_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, "r3");
    assert_eq!(history[0].version.identity, identity);
}

#[tokio::test]
async fn test_immutability_enforced() {
    let (engine, store) = sqlite_engine();
    engine
        .merge(&RequestContext::new("r1"), vec![observation("obs-1", "Patient/12345")])
        .await
        .unwrap();

    let outcomes = engine
        .merge(&RequestContext::new("r2"), vec![observation("obs-1", "Patient/99999")])
        .await
        .unwrap();
    assert_eq!(outcomes[0].rejection().unwrap().kind, RejectionKind::Immutability);

    let current = current_of(store.as_ref(), &observation("obs-1", "Patient/12345"))
        .await
        .unwrap();
    assert_eq!(current.version, 1);
}

#[tokio::test]
async fn test_batch_with_repeated_identity() {
    let (engine, store) = sqlite_engine();
    let outcomes = engine
        .merge(
            &RequestContext::new("r1"),
            vec![
                patient("a", "One"),
                patient("b", "Two"),
                PatientFixture::new("a", "One").with_gender("female").build(),
            ],
        )
        .await
        .unwrap();

    assert!(outcomes.iter().all(|o| o.created() && o.version == Some(1)));
    assert_eq!(store.count("Patient").await.unwrap(), 2);

    let current = current_of(store.as_ref(), &patient("a", "One")).await.unwrap();
    assert_eq!(current.content["gender"], "female");

    engine.wait_till_done("r1").await.unwrap();
    assert_eq!(store.count("AuditEvent").await.unwrap(), 2);
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merge.db");
    let payload = patient("persisted", "Smith");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = MergeEngine::new(test_config(), store);
        engine.merge(&RequestContext::new("r1"), vec![payload.clone()]).await.unwrap();
        engine.wait_till_done("r1").await.unwrap();
    }

    let config = SqliteStoreConfig {
        max_connections: 2,
        ..SqliteStoreConfig::default()
    };
    let store = Arc::new(SqliteStore::with_config(&path, config).unwrap());
    let engine = MergeEngine::new(test_config(), store.clone());
    let outcomes = engine.merge(&RequestContext::new("r2"), vec![payload.clone()]).await.unwrap();
    assert!(!outcomes[0].created() && !outcomes[0].updated());
    assert_eq!(outcomes[0].version, Some(1));
}
