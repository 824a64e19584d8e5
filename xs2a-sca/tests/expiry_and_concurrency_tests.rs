//! Integration tests for expiry, backend timeouts and concurrent requests

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use common::{alice, Harness};
use xs2a_sca::approach::ScaApproach;
use xs2a_sca::storage::{
    AuthorisationRecord, AuthorisationRepository, ConsentStatus, ParentResource, ParentStatus,
    ResourceKind,
};
use xs2a_sca::test_utils::MockBackend;
use xs2a_sca::{ErrorKind, ScaConfig, ScaStatus, UpdatePsuDataRequest};

/// Insert a record whose authorisation deadline passed a second ago.
async fn insert_expired(h: &Harness, resource_id: &str) -> String {
    let parent = ParentResource::new(resource_id, ResourceKind::AisConsent);
    let record = AuthorisationRecord::new(
        &parent,
        Some(alice()),
        ScaApproach::Embedded,
        ChronoDuration::minutes(10),
        ChronoDuration::seconds(-1),
        Utc::now(),
    );
    h.storage.insert(&record).await.unwrap();
    record.authorisation_id
}

#[tokio::test]
async fn test_expired_authorisation_fails_on_update() {
    let h = Harness::with_backend(MockBackend::new());
    h.consent("consent-1").await;
    let id = insert_expired(&h, "consent-1").await;

    let err = h
        .update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ResourceExpired));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
    assert_eq!(h.backend.authentications(), 0);
    assert_eq!(
        h.parent_status("consent-1").await,
        ParentStatus::Consent(ConsentStatus::Rejected)
    );

    let err = h
        .update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::StatusInvalid));
}

#[tokio::test]
async fn test_expired_authorisation_fails_on_status_read() {
    let h = Harness::with_backend(MockBackend::new());
    h.consent("consent-1").await;
    let id = insert_expired(&h, "consent-1").await;

    assert_eq!(h.node.get_sca_status(&id).await.unwrap(), ScaStatus::Failed);
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
}

#[tokio::test]
async fn test_sweep_fails_abandoned_authorisations() {
    let h = Harness::with_backend(MockBackend::new());
    h.consent("consent-1").await;
    h.consent("consent-2").await;
    let abandoned = h.start_embedded("consent-1").await;
    let done = h.start_embedded("consent-2").await;
    h.update(&done, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();
    h.update(&done, UpdatePsuDataRequest::confirmation("123456"))
        .await
        .unwrap();

    let processor = h.node.processor();
    assert_eq!(processor.sweep_expired(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + ChronoDuration::days(2);
    assert_eq!(processor.sweep_expired(later).await.unwrap(), 1);
    assert_eq!(h.record(&abandoned).await.sca_status, ScaStatus::Failed);
    assert_eq!(h.record(&done).await.sca_status, ScaStatus::Finalised);
    assert_eq!(
        h.parent_status("consent-1").await,
        ParentStatus::Consent(ConsentStatus::Rejected)
    );

    assert_eq!(processor.sweep_expired(later).await.unwrap(), 0);
}

#[tokio::test]
async fn test_background_sweep() {
    let config = ScaConfig {
        expiry_sweep_interval_secs: Some(1),
        ..Default::default()
    };
    let h = Harness::new(config, MockBackend::new());
    h.consent("consent-1").await;
    let id = insert_expired(&h, "consent-1").await;

    let handle = h.node.start_expiry_sweep().expect("sweep configured");
    // The first tick fires immediately
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.abort();

    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
}

#[tokio::test]
async fn test_sweep_disabled() {
    let config = ScaConfig {
        expiry_sweep_interval_secs: None,
        ..Default::default()
    };
    let h = Harness::new(config, MockBackend::new());
    assert!(h.node.start_expiry_sweep().is_none());
}

#[tokio::test]
async fn test_backend_timeout_fails_authorisation() {
    let config = ScaConfig {
        backend_timeout_secs: 1,
        ..Default::default()
    };
    let h = Harness::new(
        config,
        MockBackend::new().with_delay(Duration::from_millis(1500)),
    );
    h.consent("consent-1").await;
    let id = h.start_embedded("consent-1").await;

    let err = h
        .update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ServiceUnavailable));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
}

#[tokio::test]
async fn test_backend_outage_fails_authorisation() {
    let h = Harness::with_backend(MockBackend::new().unavailable());
    h.consent("consent-1").await;
    let id = h.start_embedded("consent-1").await;

    let err = h
        .update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ServiceUnavailable));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
}

#[tokio::test]
async fn test_execution_failure_fails_authorisation() {
    let h = Harness::with_backend(MockBackend::new().failing_execution());
    h.consent("consent-1").await;
    let id = h.start_embedded("consent-1").await;
    h.update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();

    let err = h
        .update(&id, UpdatePsuDataRequest::confirmation("123456"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ServiceUnavailable));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
    assert_eq!(
        h.parent_status("consent-1").await,
        ParentStatus::Consent(ConsentStatus::Rejected)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_are_serialised() {
    let h = Arc::new(Harness::with_backend(
        MockBackend::new().with_delay(Duration::from_millis(50)),
    ));
    h.consent("consent-1").await;
    let id = h.start_embedded("consent-1").await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let h = h.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            h.update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
                .await
        }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(response) => {
                assert_eq!(response.sca_status, ScaStatus::ScaMethodSelected);
                successes += 1;
            }
            Err(err) => assert_eq!(err.kind(), Some(ErrorKind::FormatError)),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(h.backend.authentications(), 1);
    let record = h.record(&id).await;
    assert_eq!(record.sca_status, ScaStatus::ScaMethodSelected);
    assert_eq!(record.version, 1);
    assert_eq!(h.node.processor().active_locks(), 0);
}

#[tokio::test]
async fn test_lock_table_does_not_grow() {
    let h = Harness::with_backend(MockBackend::new());
    h.consent("consent-1").await;

    for i in 0..100 {
        let err = h
            .update(
                &format!("unknown-{}", i),
                UpdatePsuDataRequest::identification(alice()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ResourceUnknown));
    }
    assert_eq!(h.node.processor().active_locks(), 0);

    let id = h.start_embedded("consent-1").await;
    h.update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();
    assert_eq!(h.node.processor().active_locks(), 0);

    h.update(&id, UpdatePsuDataRequest::confirmation("123456"))
        .await
        .unwrap();
    for _ in 0..10 {
        let err = h
            .update(&id, UpdatePsuDataRequest::confirmation("123456"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::StatusInvalid));
    }
    assert_eq!(h.node.processor().active_locks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_authorisations_proceed_in_parallel() {
    let h = Arc::new(Harness::with_backend(
        MockBackend::new().with_delay(Duration::from_millis(200)),
    ));
    h.consent("consent-1").await;
    h.consent("consent-2").await;
    let first = h.start_embedded("consent-1").await;
    let second = h.start_embedded("consent-2").await;

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        h.update(&first, UpdatePsuDataRequest::authentication(alice(), "secret")),
        h.update(&second, UpdatePsuDataRequest::authentication(alice(), "secret")),
    );
    a.unwrap();
    b.unwrap();

    // Each update makes three delayed backend calls
    assert!(started.elapsed() < Duration::from_millis(1100));
}
