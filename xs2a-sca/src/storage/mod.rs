//! Storage for authorisation records and their parent resources
//!
//! The state machine talks to storage through two traits:
//!
//! - [`AuthorisationRepository`]: authorisation records, with optimistic
//!   concurrency on the `version` column
//! - [`ResourceStatusStore`]: the parent consents and payments whose status
//!   is projected from their authorisations
//!
//! Two implementations are provided. [`InMemoryStorage`] is backed by
//! `DashMap` and is always available. [`Storage`] persists to SQLite via sqlx
//! and is enabled by the `storage` feature.
//!
//! # Environment Variables
//!
//! - `XS2A_SCA_DB_PATH`: Override the default database path

#[cfg(feature = "storage")]
pub mod db;
pub mod error;
pub mod memory;
pub mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

#[cfg(feature = "storage")]
pub use db::Storage;
pub use error::StorageError;
pub use memory::InMemoryStorage;
pub use models::{
    AuthenticationMethod, AuthorisationRecord, ChallengeData, ConsentStatus, ParentResource,
    ParentStatus, PsuIdData, ResourceKind, TransactionStatus,
};

/// Persistence of authorisation records.
#[async_trait]
pub trait AuthorisationRepository: Send + Sync + Debug {
    /// Insert a new record. Fails with [`StorageError::Duplicate`] if the id exists.
    async fn insert(&self, record: &AuthorisationRecord) -> Result<(), StorageError>;

    /// Fetch a record by id.
    async fn get(&self, authorisation_id: &str)
        -> Result<Option<AuthorisationRecord>, StorageError>;

    /// Store an updated record.
    ///
    /// The write only succeeds if the stored version still equals
    /// `record.version`; the returned record carries the bumped version.
    async fn save(&self, record: &AuthorisationRecord)
        -> Result<AuthorisationRecord, StorageError>;

    /// All records of a parent resource, oldest first.
    async fn list_by_parent(&self, parent_id: &str)
        -> Result<Vec<AuthorisationRecord>, StorageError>;

    /// Non-terminal records whose deadline has passed at `now`.
    async fn list_expired(&self, now: DateTime<Utc>)
        -> Result<Vec<AuthorisationRecord>, StorageError>;
}

/// Read and update access to parent resources.
#[async_trait]
pub trait ResourceStatusStore: Send + Sync + Debug {
    /// Register a parent resource.
    async fn insert_resource(&self, resource: &ParentResource) -> Result<(), StorageError>;

    /// Fetch a parent resource.
    async fn get_resource(&self, resource_id: &str)
        -> Result<Option<ParentResource>, StorageError>;

    /// Whether the resource requires multilevel SCA.
    async fn get_multilevel_flag(&self, resource_id: &str) -> Result<bool, StorageError> {
        self.get_resource(resource_id)
            .await?
            .map(|r| r.multilevel_sca_required)
            .ok_or_else(|| StorageError::NotFound(resource_id.to_string()))
    }

    /// Overwrite the status of a parent resource.
    async fn set_parent_status(
        &self,
        resource_id: &str,
        status: ParentStatus,
    ) -> Result<(), StorageError>;
}
