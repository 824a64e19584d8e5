use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::error::StorageError;
use super::models::{AuthorisationRecord, ParentResource, ParentStatus};
use super::{AuthorisationRepository, ResourceStatusStore};

/// In-process storage for authorisations and parent resources.
///
/// Used by tests and by deployments that keep authorisation state elsewhere
/// and only need the state machine semantics.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    authorisations: DashMap<String, AuthorisationRecord>,
    resources: DashMap<String, ParentResource>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorisationRepository for InMemoryStorage {
    async fn insert(&self, record: &AuthorisationRecord) -> Result<(), StorageError> {
        match self.authorisations.entry(record.authorisation_id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Duplicate(record.authorisation_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(
        &self,
        authorisation_id: &str,
    ) -> Result<Option<AuthorisationRecord>, StorageError> {
        Ok(self
            .authorisations
            .get(authorisation_id)
            .map(|r| r.value().clone()))
    }

    async fn save(
        &self,
        record: &AuthorisationRecord,
    ) -> Result<AuthorisationRecord, StorageError> {
        let mut stored = self
            .authorisations
            .get_mut(&record.authorisation_id)
            .ok_or_else(|| StorageError::NotFound(record.authorisation_id.clone()))?;

        if stored.version != record.version {
            debug!(
                "Version conflict on {}: stored {}, expected {}",
                record.authorisation_id, stored.version, record.version
            );
            return Err(StorageError::Conflict {
                id: record.authorisation_id.clone(),
                expected: record.version,
            });
        }

        let mut updated = record.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_by_parent(
        &self,
        parent_id: &str,
    ) -> Result<Vec<AuthorisationRecord>, StorageError> {
        let mut records: Vec<AuthorisationRecord> = self
            .authorisations
            .iter()
            .filter(|r| r.parent_id == parent_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthorisationRecord>, StorageError> {
        Ok(self
            .authorisations
            .iter()
            .filter(|r| !r.sca_status.is_terminal() && r.is_expired(now))
            .map(|r| r.value().clone())
            .collect())
    }
}

#[async_trait]
impl ResourceStatusStore for InMemoryStorage {
    async fn insert_resource(&self, resource: &ParentResource) -> Result<(), StorageError> {
        self.resources
            .insert(resource.resource_id.clone(), resource.clone());
        Ok(())
    }

    async fn get_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<ParentResource>, StorageError> {
        Ok(self.resources.get(resource_id).map(|r| r.value().clone()))
    }

    async fn set_parent_status(
        &self,
        resource_id: &str,
        status: ParentStatus,
    ) -> Result<(), StorageError> {
        let mut resource = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| StorageError::NotFound(resource_id.to_string()))?;
        resource.status = status;
        Ok(())
    }
}
