//! # XS2A SCA Authorisation Node
//!
//! This crate implements the Strong Customer Authentication (SCA) authorisation
//! state machine of a PSD2 / Berlin Group XS2A interface. Every consent or
//! payment is authorised by one or more authorisation sub-resources, each of
//! which walks through
//!
//! ```text
//! RECEIVED → PSU_IDENTIFIED → PSU_AUTHENTICATED → SCA_METHOD_SELECTED → FINALISED
//! ```
//!
//! or ends in `FAILED` or `EXEMPTED`.
//!
//! ## Architecture
//!
//! - **State machine** ([`state_machine`]): the transition rules, one stage
//!   handler per status and the processor that loads, validates, dispatches
//!   and persists
//! - **Approaches** ([`approach`]): embedded, redirect and decoupled SCA share
//!   one transition table and differ only in where the proof comes from
//! - **Validation** ([`validation`]): the pre-dispatch validator chain
//! - **Backend** ([`backend`]): the bank's authentication API, called under a timeout
//! - **Aggregation** ([`multilevel`], [`projector`]): parent status derived
//!   from all authorisations of a consent or payment
//! - **Storage** ([`storage`]): in-memory and SQLite repositories
//! - **Event Bus** ([`event`]): broadcasts status changes to subscribers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use xs2a_sca::approach::ScaApproach;
//! use xs2a_sca::backend::{
//!     AuthenticationOutcome, AuthorisationCodeResult, BackendError, BackendRequest,
//!     PsuAuthenticationBackend,
//! };
//! use xs2a_sca::storage::{
//!     AuthenticationMethod, ChallengeData, ParentResource, PsuIdData, ResourceKind,
//! };
//! use xs2a_sca::{ScaConfig, ScaNode, UpdatePsuDataRequest};
//!
//! /// Adapter to the bank's core banking API.
//! #[derive(Debug)]
//! struct CoreBanking;
//!
//! #[async_trait]
//! impl PsuAuthenticationBackend for CoreBanking {
//!     async fn authenticate(
//!         &self,
//!         _request: BackendRequest<'_>,
//!         _credential: &str,
//!     ) -> Result<AuthenticationOutcome, BackendError> {
//!         Err(BackendError::Unavailable("core banking not connected".to_string()))
//!     }
//!
//!     async fn list_sca_methods(
//!         &self,
//!         _request: BackendRequest<'_>,
//!     ) -> Result<Vec<AuthenticationMethod>, BackendError> {
//!         Ok(vec![AuthenticationMethod::new("sms", "SMS_OTP")])
//!     }
//!
//!     async fn request_authorisation_code(
//!         &self,
//!         _request: BackendRequest<'_>,
//!         _method: &AuthenticationMethod,
//!     ) -> Result<AuthorisationCodeResult, BackendError> {
//!         Ok(AuthorisationCodeResult::default())
//!     }
//!
//!     async fn confirm(
//!         &self,
//!         _request: BackendRequest<'_>,
//!         _code: &str,
//!         _challenge: Option<&ChallengeData>,
//!     ) -> Result<AuthenticationOutcome, BackendError> {
//!         Err(BackendError::Unavailable("core banking not connected".to_string()))
//!     }
//!
//!     async fn execute_underlying_operation(
//!         &self,
//!         _request: BackendRequest<'_>,
//!     ) -> Result<(), BackendError> {
//!         Ok(())
//!     }
//! }
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = ScaNode::in_memory(ScaConfig::default(), Arc::new(CoreBanking))?;
//!     node.register_resource(&ParentResource::new("consent-1", ResourceKind::AisConsent))
//!         .await?;
//!
//!     let started = node
//!         .start_authorisation("consent-1", None, Some(ScaApproach::Embedded))
//!         .await?;
//!     let response = node
//!         .update_psu_data(
//!             &started.authorisation_id,
//!             UpdatePsuDataRequest::authentication(PsuIdData::new("alice"), "secret"),
//!         )
//!         .await?;
//!     println!("next: {:?}", response.next_link);
//!     Ok(())
//! }
//! ```

pub mod approach;
pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod expiry_worker;
pub mod multilevel;
pub mod projector;
pub mod state_machine;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod validation;

pub use config::ScaConfig;
pub use error::{Error, ErrorKind, Result, ScaError};
pub use state_machine::{
    AuthorisationProcessor, ScaStatus, StartAuthorisationResponse, UpdatePsuDataRequest,
    UpdatePsuDataResponse,
};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use approach::{ScaApproach, ScaApproachResolver};
use backend::{BackendCaller, PsuAuthenticationBackend};
use event::EventBus;
use state_machine::StandardAuthorisationProcessor;
use storage::{
    AuthorisationRepository, InMemoryStorage, ParentResource, PsuIdData, ResourceStatusStore,
};
use validation::{create_standard_validator, AuthorisationValidator, StandardValidatorConfig};

/// The SCA node: caller-facing entry point wiring storage, backend,
/// validation and events together.
///
/// The node is cheap to share behind an `Arc`; all state lives in the
/// repositories and the per-authorisation lock table.
pub struct ScaNode {
    config: ScaConfig,
    repository: Arc<dyn AuthorisationRepository>,
    status_store: Arc<dyn ResourceStatusStore>,
    processor: Arc<StandardAuthorisationProcessor>,
    event_bus: Arc<EventBus>,
    approaches: ScaApproachResolver,
}

impl ScaNode {
    /// Create a node with the standard validator chain.
    pub fn new(
        config: ScaConfig,
        repository: Arc<dyn AuthorisationRepository>,
        status_store: Arc<dyn ResourceStatusStore>,
        backend: Arc<dyn PsuAuthenticationBackend>,
    ) -> Result<Self> {
        let validator = Arc::new(create_standard_validator(StandardValidatorConfig {
            allowed_stages: config.allowed_stages.clone(),
            ..Default::default()
        }));
        Self::with_validator(config, repository, status_store, backend, validator)
    }

    /// Create a node with a custom validator chain.
    pub fn with_validator(
        config: ScaConfig,
        repository: Arc<dyn AuthorisationRepository>,
        status_store: Arc<dyn ResourceStatusStore>,
        backend: Arc<dyn PsuAuthenticationBackend>,
        validator: Arc<dyn AuthorisationValidator>,
    ) -> Result<Self> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new());
        let processor = Arc::new(StandardAuthorisationProcessor::new(
            &config,
            repository.clone(),
            status_store.clone(),
            BackendCaller::new(backend, config.backend_timeout()),
            validator,
            event_bus.clone(),
        )?);
        let approaches = ScaApproachResolver::new(
            config.supported_approaches.clone(),
            config.default_approach,
        );

        Ok(Self {
            config,
            repository,
            status_store,
            processor,
            event_bus,
            approaches,
        })
    }

    /// Create a node on top of process-local storage.
    pub fn in_memory(
        config: ScaConfig,
        backend: Arc<dyn PsuAuthenticationBackend>,
    ) -> Result<Self> {
        let storage = Arc::new(InMemoryStorage::new());
        Self::new(config, storage.clone(), storage, backend)
    }

    /// Create a node on top of a SQLite database.
    #[cfg(feature = "storage")]
    pub async fn with_sqlite(
        config: ScaConfig,
        path: Option<std::path::PathBuf>,
        backend: Arc<dyn PsuAuthenticationBackend>,
    ) -> Result<Self> {
        let storage = Arc::new(storage::Storage::new(path).await?);
        Self::new(config, storage.clone(), storage, backend)
    }

    /// Register a consent or payment so authorisations can be started for it.
    pub async fn register_resource(&self, resource: &ParentResource) -> Result<()> {
        self.status_store.insert_resource(resource).await?;
        Ok(())
    }

    /// Start an authorisation for a parent resource.
    ///
    /// The approach is the TPP's preference if the bank supports it,
    /// otherwise the configured default.
    pub async fn start_authorisation(
        &self,
        resource_id: &str,
        psu: Option<PsuIdData>,
        preferred_approach: Option<ScaApproach>,
    ) -> std::result::Result<StartAuthorisationResponse, ScaError> {
        let approach = self.approaches.resolve(preferred_approach);
        self.processor
            .start_authorisation(resource_id, psu, approach)
            .await
    }

    /// Apply an "update PSU data" request to an authorisation.
    pub async fn update_psu_data(
        &self,
        authorisation_id: &str,
        request: UpdatePsuDataRequest,
    ) -> std::result::Result<UpdatePsuDataResponse, ScaError> {
        self.processor.update_psu_data(authorisation_id, request).await
    }

    /// Current SCA status of an authorisation.
    pub async fn get_sca_status(
        &self,
        authorisation_id: &str,
    ) -> std::result::Result<ScaStatus, ScaError> {
        self.processor.get_sca_status(authorisation_id).await
    }

    /// Ids of all authorisations of a parent resource, oldest first.
    pub async fn list_authorisations(
        &self,
        resource_id: &str,
    ) -> std::result::Result<Vec<String>, ScaError> {
        if self.status_store.get_resource(resource_id).await?.is_none() {
            return Err(ScaError::rejected(
                ErrorKind::ResourceUnknown,
                format!("resource {} not found", resource_id),
            ));
        }

        Ok(self
            .repository
            .list_by_parent(resource_id)
            .await?
            .into_iter()
            .map(|r| r.authorisation_id)
            .collect())
    }

    /// Start the background expiry sweep if configured.
    pub fn start_expiry_sweep(&self) -> Option<JoinHandle<()>> {
        let interval = self.config.expiry_sweep_interval()?;
        info!("Starting expiry sweep every {:?}", interval);
        Some(expiry_worker::start_expiry_worker(
            self.processor.clone(),
            interval,
        ))
    }

    /// The processor, for direct use of sweeps and projections.
    pub fn processor(&self) -> Arc<StandardAuthorisationProcessor> {
        self.processor.clone()
    }

    /// Get a reference to the node's event bus
    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// Get the node's configuration
    pub fn config(&self) -> &ScaConfig {
        &self.config
    }
}
