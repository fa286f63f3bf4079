//! End-to-end merge behavior over the in-memory store.

mod common;

use common::*;
use helios_merge::types::RejectionKind;
use helios_merge::{MergeMode, RequestContext, ResourceStore, identity::surrogate_id};
use serde_json::json;

#[tokio::test]
async fn test_repeated_merge_is_unchanged() {
    let (engine, store) = memory_engine();
    let payload = patient("12345", "Smith");

    let first = engine.merge(&RequestContext::new("r1"), vec![payload.clone()]).await.unwrap();
    assert!(first[0].created());
    assert_eq!(first[0].version, Some(1));

    for request in ["r2", "r3"] {
        let again = engine
            .merge(&RequestContext::new(request), vec![payload.clone()])
            .await
            .unwrap();
        assert!(!again[0].created());
        assert!(!again[0].updated());
        assert!(again[0].rejection().is_none());
        assert_eq!(again[0].version, Some(1));
    }

    let identity = identity_of(&payload);
    let current = current_of(store.as_ref(), &payload).await.unwrap();
    assert_eq!(current.version, 1);
    assert!(store.history("Patient", identity.surrogate_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_changed_field_creates_new_version() {
    let (engine, store) = memory_engine();
    let ctx = RequestContext::new("r1");
    engine.merge(&ctx, vec![patient("1", "Smith")]).await.unwrap();

    let update = PatientFixture::new("1", "Smith").with_gender("male").build();
    let outcomes = engine.merge(&RequestContext::new("r2"), vec![update.clone()]).await.unwrap();
    assert!(outcomes[0].updated());
    assert_eq!(outcomes[0].version, Some(2));

    let current = current_of(store.as_ref(), &update).await.unwrap();
    assert_eq!(current.content["gender"], "male");
    assert_eq!(current.content["meta"]["versionId"], "2");

    let history = store
        .history("Patient", identity_of(&update).surrogate_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, "r2");
    assert!(history[0].version.content.get("gender").is_none());
}

#[tokio::test]
async fn test_subject_reference_is_immutable() {
    let (engine, store) = memory_engine();
    let original = observation("obs-1", "Patient/12345");
    engine.merge(&RequestContext::new("r1"), vec![original.clone()]).await.unwrap();

    let repointed = observation("obs-1", "Patient/99999");
    let outcomes = engine.merge(&RequestContext::new("r2"), vec![repointed]).await.unwrap();

    let rejection = outcomes[0].rejection().expect("re-pointing must be rejected");
    assert_eq!(rejection.kind, RejectionKind::Immutability);
    assert_eq!(rejection.field.as_deref(), Some("/subject/reference"));
    assert!(rejection.reason.contains("Patient/12345"));

    let current = current_of(store.as_ref(), &original).await.unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(current.content["subject"]["reference"], "Patient/12345");
}

#[tokio::test]
async fn test_other_fields_update_when_subject_unchanged() {
    let (engine, _) = memory_engine();
    engine
        .merge(&RequestContext::new("r1"), vec![observation("obs-1", "Patient/12345")])
        .await
        .unwrap();

    let amended = ObservationFixture::new("obs-1", "Patient/12345")
        .with_status("amended")
        .with_value(120.0)
        .build();
    let outcomes = engine.merge(&RequestContext::new("r2"), vec![amended]).await.unwrap();
    assert!(outcomes[0].updated());
}

#[tokio::test]
async fn test_invalid_item_does_not_affect_batch() {
    let (engine, store) = memory_engine();
    let mut payloads: Vec<_> = (0..10).map(|i| patient(&format!("p{}", i), "Batch")).collect();
    payloads[5] = json!({ "id": "p5", "name": [{ "family": "NoType" }] });

    let outcomes = engine.merge(&RequestContext::new("r1"), payloads).await.unwrap();
    assert_eq!(outcomes.len(), 10);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.logical_id.as_deref(), Some(format!("p{}", i).as_str()));
        if i == 5 {
            assert_eq!(outcome.rejection().unwrap().kind, RejectionKind::Validation);
        } else {
            assert!(outcome.created(), "item {} should be created", i);
        }
    }
    assert_eq!(store.count("Patient").await.unwrap(), 9);
}

#[tokio::test]
async fn test_bundle_body() {
    let (engine, store) = memory_engine();
    let body = json!({
        "resourceType": "Bundle",
        "type": "batch",
        "entry": [
            { "resource": patient("b1", "One") },
            { "resource": observation("o1", "Patient/b1") },
            { "request": { "method": "POST" } }
        ]
    });

    let outcomes = engine.merge_body(&RequestContext::new("r1"), body).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].created());
    assert!(outcomes[1].created());
    assert!(outcomes[2].rejection().is_some());
    assert_eq!(store.count("Observation").await.unwrap(), 1);
}

#[tokio::test]
async fn test_long_ids_are_accepted() {
    let (engine, _) = memory_engine();
    let id = "x".repeat(100);
    let outcomes = engine
        .merge(&RequestContext::new("r1"), vec![patient(&id, "Long")])
        .await
        .unwrap();
    assert!(outcomes[0].created());
    assert_eq!(outcomes[0].logical_id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn test_uuid_ids_pass_through() {
    let (engine, _) = memory_engine();
    let id = "0b6c0b0e-9a8f-4d2a-9a4e-2d5c1f7e8a11";
    let outcomes = engine
        .merge(&RequestContext::new("r1"), vec![patient(id, "Uuid")])
        .await
        .unwrap();
    assert_eq!(outcomes[0].surrogate_id.unwrap().to_string(), id);
}

#[tokio::test]
async fn test_same_id_different_owner_are_distinct() {
    let (engine, store) = memory_engine();
    let a = PatientFixture::new("1", "A").with_owner(Some("clinic-a")).build();
    let b = PatientFixture::new("1", "B").with_owner(Some("clinic-b")).build();

    let outcomes = engine.merge(&RequestContext::new("r1"), vec![a, b]).await.unwrap();
    assert!(outcomes.iter().all(|o| o.created()));
    assert_ne!(outcomes[0].surrogate_id, outcomes[1].surrogate_id);
    assert_eq!(outcomes[0].surrogate_id, Some(surrogate_id("Patient", "1", "clinic-a")));
    assert_eq!(store.count("Patient").await.unwrap(), 2);
}

#[tokio::test]
async fn test_missing_authority_is_rejected() {
    let (engine, _) = memory_engine();
    let payload = PatientFixture::new("1", "A").with_owner(None).build();
    let outcomes = engine.merge(&RequestContext::new("r1"), vec![payload]).await.unwrap();
    assert_eq!(outcomes[0].rejection().unwrap().kind, RejectionKind::Identity);
}

#[tokio::test]
async fn test_duplicate_entries_fold_in_order() {
    let (engine, store) = memory_engine();
    let first = PatientFixture::new("1", "Smith").with_identifier("urn:mrn", "A").build();
    let second = PatientFixture::new("1", "Smith").with_identifier("urn:mrn", "B").build();
    let third = second.clone();

    let outcomes = engine
        .merge(&RequestContext::new("r1"), vec![first, second, third.clone()])
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.created()));
    assert!(outcomes.iter().all(|o| o.version == Some(1)));

    let current = current_of(store.as_ref(), &third).await.unwrap();
    assert_eq!(current.version, 1);
    let identity = identity_of(&third);
    assert!(store.history("Patient", identity.surrogate_id).await.unwrap().is_empty());
    let values: Vec<&str> = current.content["identifier"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|i| i["system"] == "urn:mrn")
        .filter_map(|i| i["value"].as_str())
        .collect();
    assert_eq!(values, vec!["A", "B"]);
}

#[tokio::test]
async fn test_duplicate_entries_update_once() {
    let (engine, store) = memory_engine();
    let seed = patient("1", "Smith");
    engine.merge(&RequestContext::new("r1"), vec![seed.clone()]).await.unwrap();

    let outcomes = engine
        .merge(
            &RequestContext::new("r2"),
            vec![
                PatientFixture::new("1", "Smith").with_identifier("urn:mrn", "A").build(),
                PatientFixture::new("1", "Smith").with_identifier("urn:mrn", "B").build(),
            ],
        )
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.updated() && o.version == Some(2)));

    let identity = identity_of(&seed);
    let history = store.history("Patient", identity.surrogate_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version_number(), 1);
}

#[tokio::test]
async fn test_duplicate_entries_rejected_together() {
    let (engine, store) = memory_engine();
    let ok = observation("obs-1", "Patient/1");
    let repointed = observation("obs-1", "Patient/2");

    let outcomes = engine
        .merge(&RequestContext::new("r1"), vec![ok.clone(), repointed])
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.rejection().is_some()));
    assert!(current_of(store.as_ref(), &ok).await.is_none());
}

#[tokio::test]
async fn test_replace_mode_drops_absent_fields() {
    let store = std::sync::Arc::new(helios_merge::MemoryStore::new());
    let config = helios_merge::MergeConfig {
        merge_mode: MergeMode::Replace,
        ..test_config()
    };
    let engine = helios_merge::MergeEngine::new(config, store.clone());

    let with_gender = PatientFixture::new("1", "Smith").with_gender("male").build();
    engine.merge(&RequestContext::new("r1"), vec![with_gender]).await.unwrap();

    let without = patient("1", "Smith");
    let outcomes = engine.merge(&RequestContext::new("r2"), vec![without.clone()]).await.unwrap();
    assert!(outcomes[0].updated());
    let current = current_of(store.as_ref(), &without).await.unwrap();
    assert!(current.content.get("gender").is_none());
}

#[tokio::test]
async fn test_outcome_json_shape() {
    let (engine, _) = memory_engine();
    let outcomes = engine
        .merge(
            &RequestContext::new("r1"),
            vec![patient("1", "A"), json!({ "resourceType": "Patient", "id": "bad id" })],
        )
        .await
        .unwrap();

    let created = serde_json::to_value(&outcomes[0]).unwrap();
    assert_eq!(created["id"], "1");
    assert_eq!(created["resourceType"], "Patient");
    assert_eq!(created["sourceAssigningAuthority"], "clinic");
    assert_eq!(created["created"], true);
    assert_eq!(created["updated"], false);
    assert!(created["uuid"].is_string());
    assert!(created.get("issue").is_none());

    let rejected = serde_json::to_value(&outcomes[1]).unwrap();
    assert_eq!(rejected["created"], false);
    assert_eq!(rejected["issue"]["severity"], "error");
}

#[tokio::test]
async fn test_unavailable_store_aborts_request() {
    let (engine, store) = memory_engine();
    store.set_available(false);
    let err = engine
        .merge(&RequestContext::new("r1"), vec![patient("1", "A")])
        .await
        .unwrap_err();
    assert!(matches!(err, helios_merge::MergeError::BatchAborted { .. }));
}
