//! Integration tests for the redirect and decoupled approaches

mod common;

use common::{alice, two_methods, Harness};
use xs2a_sca::approach::{BankOutcome, LinkRelation, ScaApproach};
use xs2a_sca::storage::{ConsentStatus, ParentStatus, ResourceKind, TransactionStatus};
use xs2a_sca::test_utils::MockBackend;
use xs2a_sca::validation::AllowedStagePolicy;
use xs2a_sca::{ErrorKind, ScaConfig, ScaStatus, UpdatePsuDataRequest};

#[tokio::test]
async fn test_redirect_flow() {
    let h = Harness::with_backend(MockBackend::new());
    h.register(xs2a_sca::storage::ParentResource::new(
        "pay-1",
        ResourceKind::PisPayment,
    ))
    .await;

    let started = h
        .node
        .start_authorisation("pay-1", None, Some(ScaApproach::Redirect))
        .await
        .unwrap();
    assert_eq!(started.sca_approach, ScaApproach::Redirect);
    assert_eq!(started.next_link.rel, LinkRelation::ScaRedirect);
    assert_eq!(
        started.next_link.href,
        format!(
            "http://localhost:4200/authorisation/{}",
            started.authorisation_id
        )
    );
    let id = started.authorisation_id;

    // A password only identifies the PSU of a redirect authorisation
    let response = h
        .update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();
    assert_eq!(response.sca_status, ScaStatus::PsuIdentified);
    assert_eq!(response.next_link.rel, LinkRelation::ScaRedirect);
    assert_eq!(h.backend.authentications(), 0);

    let response = h
        .update(&id, UpdatePsuDataRequest::bank_callback(BankOutcome::Confirmed))
        .await
        .unwrap();
    assert_eq!(response.sca_status, ScaStatus::ScaMethodSelected);
    assert_eq!(response.next_link.rel, LinkRelation::ScaStatus);

    let response = h
        .update(&id, UpdatePsuDataRequest::bank_callback(BankOutcome::Confirmed))
        .await
        .unwrap();
    assert_eq!(response.sca_status, ScaStatus::Finalised);
    assert_eq!(
        h.parent_status("pay-1").await,
        ParentStatus::Payment(TransactionStatus::Acsp)
    );
}

#[tokio::test]
async fn test_redirect_rejected_by_bank() {
    let h = Harness::with_backend(MockBackend::new());
    h.consent("consent-1").await;
    let id = h
        .node
        .start_authorisation("consent-1", None, Some(ScaApproach::Redirect))
        .await
        .unwrap()
        .authorisation_id;

    let err = h
        .update(&id, UpdatePsuDataRequest::bank_callback(BankOutcome::Rejected))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::PsuCredentialsInvalid));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
    assert_eq!(
        h.parent_status("consent-1").await,
        ParentStatus::Consent(ConsentStatus::Rejected)
    );
}

#[tokio::test]
async fn test_decoupled_flow() {
    let h = Harness::with_backend(MockBackend::new().with_methods(two_methods()));
    h.consent("consent-1").await;
    let id = h
        .node
        .start_authorisation("consent-1", Some(alice()), Some(ScaApproach::Decoupled))
        .await
        .unwrap()
        .authorisation_id;

    let response = h
        .update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();
    assert_eq!(response.sca_status, ScaStatus::PsuAuthenticated);

    let response = h
        .update(&id, UpdatePsuDataRequest::method_selection("photo"))
        .await
        .unwrap();
    assert_eq!(response.sca_status, ScaStatus::ScaMethodSelected);
    assert_eq!(response.next_link.rel, LinkRelation::ScaStatus);

    // The code is confirmed on the PSU's device, not through the TPP
    let err = h
        .update(&id, UpdatePsuDataRequest::confirmation("123456"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::FormatError));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::ScaMethodSelected);

    let response = h
        .update(&id, UpdatePsuDataRequest::bank_callback(BankOutcome::Confirmed))
        .await
        .unwrap();
    assert_eq!(response.sca_status, ScaStatus::Finalised);
    assert_eq!(h.backend.confirmations(), 0);
}

#[tokio::test]
async fn test_decoupled_rejection_fails() {
    let h = Harness::with_backend(MockBackend::new());
    h.consent("consent-1").await;
    let id = h
        .node
        .start_authorisation("consent-1", Some(alice()), Some(ScaApproach::Decoupled))
        .await
        .unwrap()
        .authorisation_id;
    h.update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();

    let err = h
        .update(&id, UpdatePsuDataRequest::bank_callback(BankOutcome::Rejected))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ScaInvalid));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::Failed);
}

#[tokio::test]
async fn test_unsupported_preference_falls_back_to_default() {
    let config = ScaConfig {
        default_approach: ScaApproach::Embedded,
        supported_approaches: vec![ScaApproach::Embedded, ScaApproach::Decoupled],
        ..Default::default()
    };
    let h = Harness::new(config, MockBackend::new());
    h.consent("consent-1").await;

    let started = h
        .node
        .start_authorisation("consent-1", None, Some(ScaApproach::Redirect))
        .await
        .unwrap();
    assert_eq!(started.sca_approach, ScaApproach::Embedded);

    let started = h
        .node
        .start_authorisation("consent-1", None, Some(ScaApproach::Decoupled))
        .await
        .unwrap();
    assert_eq!(started.sca_approach, ScaApproach::Decoupled);

    let started = h
        .node
        .start_authorisation("consent-1", None, None)
        .await
        .unwrap();
    assert_eq!(started.sca_approach, ScaApproach::Embedded);
}

#[tokio::test]
async fn test_restricted_stage_is_refused() {
    let config = ScaConfig {
        allowed_stages: AllowedStagePolicy::default().restrict(
            ScaApproach::Embedded,
            vec![ScaStatus::Received, ScaStatus::PsuIdentified],
        ),
        ..Default::default()
    };
    let h = Harness::new(config, MockBackend::new().with_methods(two_methods()));
    h.consent("consent-1").await;
    let id = h.start_embedded("consent-1").await;

    h.update(&id, UpdatePsuDataRequest::authentication(alice(), "secret"))
        .await
        .unwrap();
    let err = h
        .update(&id, UpdatePsuDataRequest::method_selection("sms"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::StatusInvalid));
    assert_eq!(h.record(&id).await.sca_status, ScaStatus::PsuAuthenticated);
}
