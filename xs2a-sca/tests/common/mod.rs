//! Shared harness for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use xs2a_sca::approach::ScaApproach;
use xs2a_sca::storage::{
    AuthenticationMethod, AuthorisationRecord, AuthorisationRepository, InMemoryStorage,
    ParentResource, ParentStatus, PsuIdData, ResourceKind, ResourceStatusStore,
};
use xs2a_sca::test_utils::MockBackend;
use xs2a_sca::{ScaConfig, ScaNode, UpdatePsuDataRequest, UpdatePsuDataResponse};

/// A node over in-memory storage, with handles on storage and backend.
pub struct Harness {
    pub node: Arc<ScaNode>,
    pub storage: Arc<InMemoryStorage>,
    pub backend: Arc<MockBackend>,
}

impl Harness {
    pub fn new(config: ScaConfig, backend: MockBackend) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let backend = Arc::new(backend);
        let node = ScaNode::new(config, storage.clone(), storage.clone(), backend.clone())
            .expect("Failed to create node");
        Self {
            node: Arc::new(node),
            storage,
            backend,
        }
    }

    pub fn with_backend(backend: MockBackend) -> Self {
        Self::new(ScaConfig::default(), backend)
    }

    pub async fn register(&self, resource: ParentResource) {
        self.node
            .register_resource(&resource)
            .await
            .expect("Failed to register resource");
    }

    pub async fn consent(&self, id: &str) {
        self.register(ParentResource::new(id, ResourceKind::AisConsent))
            .await;
    }

    /// Start an embedded authorisation for alice.
    pub async fn start_embedded(&self, resource_id: &str) -> String {
        self.node
            .start_authorisation(resource_id, Some(alice()), Some(ScaApproach::Embedded))
            .await
            .expect("Failed to start authorisation")
            .authorisation_id
    }

    pub async fn update(
        &self,
        authorisation_id: &str,
        request: UpdatePsuDataRequest,
    ) -> Result<UpdatePsuDataResponse, xs2a_sca::ScaError> {
        self.node.update_psu_data(authorisation_id, request).await
    }

    pub async fn record(&self, authorisation_id: &str) -> AuthorisationRecord {
        self.storage
            .get(authorisation_id)
            .await
            .unwrap()
            .expect("record missing")
    }

    pub async fn parent_status(&self, resource_id: &str) -> ParentStatus {
        self.storage
            .get_resource(resource_id)
            .await
            .unwrap()
            .expect("resource missing")
            .status
    }
}

pub fn alice() -> PsuIdData {
    PsuIdData::new("alice")
}

pub fn bob() -> PsuIdData {
    PsuIdData::new("bob")
}

pub fn two_methods() -> Vec<AuthenticationMethod> {
    vec![
        AuthenticationMethod::new("sms", "SMS_OTP"),
        AuthenticationMethod::new("photo", "PHOTO_OTP"),
    ]
}
