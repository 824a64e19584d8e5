//! Authorisation state machine for the SCA node
//!
//! [`StandardAuthorisationProcessor`] drives one "update PSU data" request
//! through the fixed pipeline:
//!
//! 1. load the record (`RESOURCE_UNKNOWN` if absent)
//! 2. refuse terminal records (`STATUS_INVALID`)
//! 3. fail expired records (`RESOURCE_EXPIRED`)
//! 4. run the validation chain
//! 5. dispatch to the stage handler of the current status
//! 6. persist, project the parent status, publish events
//!
//! Requests for the same authorisation id are serialised through a per-id
//! async mutex; storage writes are additionally guarded by the record version.
//!
//! ## Sub-modules
//!
//! - [`fsm`]: statuses, transition rules and the dispatch table
//! - [`stages`]: the stage handlers

pub mod fsm;
pub mod stages;

pub use fsm::{
    AuthorisationFsm, ExemptionPolicy, InvalidTransition, ScaStatus, StageError, StageOutcome,
    StagePolicy, Transition, UpdatePsuDataRequest, ZeroMethodsPolicy,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::approach::{evidence_source, LinkBuilder, NextLink, ScaApproach};
use crate::backend::BackendCaller;
use crate::config::ScaConfig;
use crate::error::{Error, ErrorKind, Result, ScaError};
use crate::event::{EventBus, ScaEvent};
use crate::projector::StatusProjector;
use crate::storage::{
    AuthenticationMethod, AuthorisationRecord, AuthorisationRepository, ChallengeData,
    ParentStatus, PsuIdData, ResourceStatusStore, StorageError,
};
use crate::validation::{AuthorisationValidator, ValidationContext, ValidationResult};
use stages::StageContext;

/// Response to a successful "update PSU data" request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePsuDataResponse {
    pub authorisation_id: String,
    pub sca_status: ScaStatus,
    pub sca_approach: ScaApproach,
    pub psu: Option<PsuIdData>,
    /// Methods to choose from, only while the PSU has to choose
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sca_methods: Vec<AuthenticationMethod>,
    pub chosen_sca_method: Option<AuthenticationMethod>,
    pub challenge_data: Option<ChallengeData>,
    pub next_link: NextLink,
}

/// Response to starting an authorisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAuthorisationResponse {
    pub authorisation_id: String,
    pub sca_status: ScaStatus,
    pub sca_approach: ScaApproach,
    pub next_link: NextLink,
}

/// Trait for processing "update PSU data" requests
#[async_trait]
pub trait AuthorisationProcessor: Send + Sync {
    /// Apply one request to the authorisation `authorisation_id`.
    async fn update_psu_data(
        &self,
        authorisation_id: &str,
        request: UpdatePsuDataRequest,
    ) -> std::result::Result<UpdatePsuDataResponse, ScaError>;
}

/// Standard authorisation processor
pub struct StandardAuthorisationProcessor {
    repository: Arc<dyn AuthorisationRepository>,
    status_store: Arc<dyn ResourceStatusStore>,
    backend: BackendCaller,
    validator: Arc<dyn AuthorisationValidator>,
    event_bus: Arc<EventBus>,
    links: LinkBuilder,
    policy: StagePolicy,
    redirect_url_ttl: chrono::Duration,
    authorisation_ttl: chrono::Duration,
    /// Per-authorisation locks keyed by authorisation id.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for StandardAuthorisationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardAuthorisationProcessor")
            .field("policy", &self.policy)
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl StandardAuthorisationProcessor {
    /// Create a new processor from the node configuration.
    pub fn new(
        config: &ScaConfig,
        repository: Arc<dyn AuthorisationRepository>,
        status_store: Arc<dyn ResourceStatusStore>,
        backend: BackendCaller,
        validator: Arc<dyn AuthorisationValidator>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        Ok(Self {
            repository,
            status_store,
            backend,
            validator,
            event_bus,
            links: config.link_builder()?,
            policy: config.stage_policy(),
            redirect_url_ttl: config.redirect_url_ttl(),
            authorisation_ttl: config.authorisation_ttl(),
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, authorisation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(authorisation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the table entry once no other request waits on it.
    fn release_lock(&self, authorisation_id: &str, lock: Arc<Mutex<()>>) {
        self.locks.remove_if(authorisation_id, |_, held| {
            Arc::ptr_eq(held, &lock) && Arc::strong_count(held) == 2
        });
    }

    /// Number of authorisation ids with a request in flight.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    async fn load(
        &self,
        authorisation_id: &str,
    ) -> std::result::Result<AuthorisationRecord, ScaError> {
        self.repository.get(authorisation_id).await?.ok_or_else(|| {
            ScaError::rejected(
                ErrorKind::ResourceUnknown,
                format!("authorisation {} not found", authorisation_id),
            )
        })
    }

    /// Persist a working copy. A version conflict means someone else won.
    async fn persist(
        &self,
        mut record: AuthorisationRecord,
        now: DateTime<Utc>,
    ) -> std::result::Result<AuthorisationRecord, ScaError> {
        record.updated_at = now;
        match self.repository.save(&record).await {
            Ok(saved) => Ok(saved),
            Err(StorageError::Conflict { id, .. }) => {
                warn!("Concurrent modification of authorisation {}", id);
                Err(ScaError::rejected(
                    ErrorKind::StatusInvalid,
                    "authorisation was modified concurrently",
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_rejection(&self, authorisation_id: &str, error: &ScaError) {
        if let ScaError::Rejected { kind, message } = error {
            self.event_bus
                .publish(ScaEvent::AuthorisationRejected {
                    authorisation_id: authorisation_id.to_string(),
                    error: *kind,
                    message: message.clone(),
                })
                .await;
        }
    }

    async fn publish_status_change(&self, record: &AuthorisationRecord, old_status: ScaStatus) {
        if record.sca_status == old_status {
            return;
        }
        info!(
            "Authorisation {} moved {} -> {}",
            record.authorisation_id, old_status, record.sca_status
        );
        self.event_bus
            .publish(ScaEvent::ScaStatusChanged {
                authorisation_id: record.authorisation_id.clone(),
                parent_id: record.parent_id.clone(),
                old_status: old_status.to_string(),
                new_status: record.sca_status.to_string(),
            })
            .await;
    }

    /// Recompute the parent status from all its authorisations and store it
    /// if it changed.
    pub async fn project_parent(&self, parent_id: &str) -> Result<Option<ParentStatus>> {
        let resource = self
            .status_store
            .get_resource(parent_id)
            .await?
            .ok_or_else(|| Error::Invariant(format!("parent resource {} missing", parent_id)))?;

        let statuses: Vec<ScaStatus> = self
            .repository
            .list_by_parent(parent_id)
            .await?
            .iter()
            .map(|r| r.sca_status)
            .collect();

        let Some(projected) = StatusProjector::derive(&resource, &statuses) else {
            return Ok(None);
        };

        self.status_store
            .set_parent_status(parent_id, projected)
            .await?;
        info!(
            "Parent {} moved {} -> {}",
            parent_id, resource.status, projected
        );
        self.event_bus
            .publish(ScaEvent::ParentStatusChanged {
                parent_id: parent_id.to_string(),
                old_status: resource.status.to_string(),
                new_status: projected.to_string(),
            })
            .await;

        Ok(Some(projected))
    }

    /// Fail an expired record. The caller must hold the record's lock.
    async fn expire(
        &self,
        record: AuthorisationRecord,
        now: DateTime<Utc>,
    ) -> std::result::Result<AuthorisationRecord, ScaError> {
        let old_status = record.sca_status;
        let mut working = record;
        working.sca_status = ScaStatus::Failed;
        let saved = self.persist(working, now).await?;

        info!("Authorisation {} expired", saved.authorisation_id);
        self.event_bus
            .publish(ScaEvent::AuthorisationExpired {
                authorisation_id: saved.authorisation_id.clone(),
                parent_id: saved.parent_id.clone(),
            })
            .await;
        self.publish_status_change(&saved, old_status).await;
        self.project_parent(&saved.parent_id).await?;
        Ok(saved)
    }

    fn response(&self, record: &AuthorisationRecord) -> UpdatePsuDataResponse {
        let sca_methods = if record.sca_status == ScaStatus::PsuAuthenticated {
            record.available_sca_methods.clone()
        } else {
            Vec::new()
        };

        UpdatePsuDataResponse {
            authorisation_id: record.authorisation_id.clone(),
            sca_status: record.sca_status,
            sca_approach: record.sca_approach,
            psu: record.psu.clone(),
            sca_methods,
            chosen_sca_method: record.chosen_sca_method.clone(),
            challenge_data: record.challenge_data.clone(),
            next_link: self.links.next_link(record),
        }
    }

    /// Create a new authorisation for a parent resource.
    pub async fn start_authorisation(
        &self,
        resource_id: &str,
        psu: Option<PsuIdData>,
        approach: ScaApproach,
    ) -> std::result::Result<StartAuthorisationResponse, ScaError> {
        let resource = self.status_store.get_resource(resource_id).await?.ok_or_else(|| {
            ScaError::rejected(
                ErrorKind::ResourceUnknown,
                format!("resource {} not found", resource_id),
            )
        })?;

        if !resource.status.accepts_authorisation() {
            return Err(ScaError::rejected(
                ErrorKind::StatusInvalid,
                format!("resource {} is {}", resource_id, resource.status),
            ));
        }

        let psu = psu.filter(|p| !p.is_empty());
        if resource.multilevel_sca_required {
            if let Some(psu) = psu.as_ref() {
                if !resource.psus.is_empty() && !resource.psus.iter().any(|p| p.matches(psu)) {
                    return Err(ScaError::rejected(
                        ErrorKind::ResourceUnknown,
                        "PSU is not a co-signer of this resource",
                    ));
                }
                let existing = self.repository.list_by_parent(resource_id).await?;
                let busy = existing.iter().any(|r| {
                    r.sca_status != ScaStatus::Failed
                        && r.psu.as_ref().map_or(false, |p| p.matches(psu))
                });
                if busy {
                    return Err(ScaError::rejected(
                        ErrorKind::StatusInvalid,
                        "PSU already has an authorisation for this resource",
                    ));
                }
            }
        }

        let record = AuthorisationRecord::new(
            &resource,
            psu,
            approach,
            self.redirect_url_ttl,
            self.authorisation_ttl,
            Utc::now(),
        );
        self.repository.insert(&record).await?;

        info!(
            "Started {} authorisation {} for {}",
            approach, record.authorisation_id, resource_id
        );
        self.event_bus
            .publish(ScaEvent::AuthorisationCreated {
                authorisation_id: record.authorisation_id.clone(),
                parent_id: record.parent_id.clone(),
                sca_approach: approach.to_string(),
            })
            .await;

        Ok(StartAuthorisationResponse {
            authorisation_id: record.authorisation_id.clone(),
            sca_status: record.sca_status,
            sca_approach: record.sca_approach,
            next_link: self.links.next_link(&record),
        })
    }

    /// Current SCA status. An expired record is failed on read.
    pub async fn get_sca_status(
        &self,
        authorisation_id: &str,
    ) -> std::result::Result<ScaStatus, ScaError> {
        let record = self.load(authorisation_id).await?;
        let now = Utc::now();
        if record.sca_status.is_terminal() || !record.is_expired(now) {
            return Ok(record.sca_status);
        }

        let lock = self.lock_for(authorisation_id);
        let result = {
            let _guard = lock.lock().await;
            match self.load(authorisation_id).await {
                Ok(record) if record.sca_status.is_terminal() => Ok(record.sca_status),
                Ok(record) => self.expire(record, now).await.map(|r| r.sca_status),
                Err(err) => Err(err),
            }
        };
        self.release_lock(authorisation_id, lock);
        result
    }

    /// Fail one sweep candidate if it is still live and expired. The caller
    /// must hold the record's lock.
    async fn expire_candidate(
        &self,
        authorisation_id: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<bool, ScaError> {
        let Some(record) = self.repository.get(authorisation_id).await? else {
            return Ok(false);
        };
        if record.sca_status.is_terminal() || !record.is_expired(now) {
            return Ok(false);
        }
        self.expire(record, now).await.map(|_| true)
    }

    /// Fail every non-terminal record whose deadline passed at `now`.
    ///
    /// Returns the number of records failed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self.repository.list_expired(now).await?;
        let mut expired = 0;

        for candidate in candidates {
            let lock = self.lock_for(&candidate.authorisation_id);
            let outcome = {
                let _guard = lock.lock().await;
                self.expire_candidate(&candidate.authorisation_id, now).await
            };
            self.release_lock(&candidate.authorisation_id, lock);

            match outcome {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(ScaError::Rejected { message, .. }) => {
                    debug!(
                        "Skipping {} during sweep: {}",
                        candidate.authorisation_id, message
                    );
                }
                Err(ScaError::Fault(e)) => return Err(e),
            }
        }

        Ok(expired)
    }

    async fn process(
        &self,
        authorisation_id: &str,
        request: &UpdatePsuDataRequest,
    ) -> std::result::Result<UpdatePsuDataResponse, ScaError> {
        let record = self.load(authorisation_id).await?;

        if record.sca_status.is_terminal() {
            return Err(ScaError::rejected(
                ErrorKind::StatusInvalid,
                format!("authorisation is {}", record.sca_status),
            ));
        }

        let now = Utc::now();
        if record.is_expired(now) {
            self.expire(record, now).await?;
            return Err(ScaError::rejected(
                ErrorKind::ResourceExpired,
                "authorisation has expired",
            ));
        }

        let resource = self
            .status_store
            .get_resource(&record.parent_id)
            .await?
            .ok_or_else(|| {
                ScaError::rejected(
                    ErrorKind::ResourceUnknown,
                    format!("resource {} not found", record.parent_id),
                )
            })?;
        let siblings = if resource.multilevel_sca_required {
            self.repository.list_by_parent(&record.parent_id).await?
        } else {
            Vec::new()
        };

        let validation = self
            .validator
            .validate(&ValidationContext {
                request,
                record: &record,
                resource: &resource,
                siblings: &siblings,
            })
            .await;
        if let ValidationResult::Reject(kind, reason) = validation {
            return Err(ScaError::rejected(kind, reason));
        }

        let old_status = record.sca_status;
        let mut working = record.clone();
        let handler = AuthorisationFsm::handler_for(old_status);
        let outcome = handler(StageContext {
            record: &mut working,
            request,
            resource: &resource,
            backend: &self.backend,
            evidence: evidence_source(record.sca_approach),
            policy: self.policy,
            now,
        })
        .await;

        debug!("Stage outcome for {}: {:?}", authorisation_id, outcome);

        match outcome {
            StageOutcome::Transition(next) => {
                AuthorisationFsm::check_transition(old_status, next, self.policy.exemption)
                    .map_err(|e| Error::Invariant(e.to_string()))?;
                working.sca_status = next;
                let saved = self.persist(working, now).await?;
                self.publish_status_change(&saved, old_status).await;
                if next.is_terminal() {
                    self.project_parent(&saved.parent_id).await?;
                }
                Ok(self.response(&saved))
            }
            StageOutcome::Reject(e) => Err(ScaError::rejected(e.kind, e.message)),
            StageOutcome::Retry(e) => {
                working.sca_status = old_status;
                self.persist(working, now).await?;
                Err(ScaError::rejected(e.kind, e.message))
            }
            StageOutcome::Fail(e) => {
                working.sca_status = ScaStatus::Failed;
                let saved = self.persist(working, now).await?;
                self.publish_status_change(&saved, old_status).await;
                self.project_parent(&saved.parent_id).await?;
                Err(ScaError::rejected(e.kind, e.message))
            }
        }
    }
}

#[async_trait]
impl AuthorisationProcessor for StandardAuthorisationProcessor {
    async fn update_psu_data(
        &self,
        authorisation_id: &str,
        request: UpdatePsuDataRequest,
    ) -> std::result::Result<UpdatePsuDataResponse, ScaError> {
        let lock = self.lock_for(authorisation_id);
        let result = {
            let _guard = lock.lock().await;
            self.process(authorisation_id, &request).await
        };
        self.release_lock(authorisation_id, lock);

        if let Err(err) = &result {
            debug!("update_psu_data on {} failed: {}", authorisation_id, err);
            self.publish_rejection(authorisation_id, err).await;
        }
        result
    }
}
