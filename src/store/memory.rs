//! In-memory stores backed by `DashMap`.
//!
//! Conditional transitions run under the shard write lock held by
//! `get_mut`, which makes the compare-and-set atomic with respect to other
//! writers of the same id.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{
    AccessGrant, AccessRequest, GrantStore, RequestStatus, RequestStore, StatusUpdate, StoreError,
    Transition,
};

/// Process-local request store.
#[derive(Default)]
pub struct InMemoryRequestStore {
    requests: DashMap<String, AccessRequest>,
}

impl InMemoryRequestStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, request: &AccessRequest) -> Result<(), StoreError> {
        match self.requests.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(request.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<AccessRequest>, StoreError> {
        Ok(self.requests.get(id).map(|r| r.value().clone()))
    }

    async fn transition(
        &self,
        id: &str,
        expected: RequestStatus,
        update: StatusUpdate,
    ) -> Result<Transition, StoreError> {
        let Some(mut entry) = self.requests.get_mut(id) else {
            return Ok(Transition::Missing);
        };
        if entry.status != expected {
            return Ok(Transition::Conflict(entry.status));
        }
        entry.status = update.status;
        entry.decided_by = update.decided_by;
        entry.decided_at = update.decided_at;
        Ok(Transition::Applied(entry.value().clone()))
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        Ok(self
            .requests
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect())
    }
}

/// Process-local grant store.
#[derive(Default)]
pub struct InMemoryGrantStore {
    grants: DashMap<(String, String), AccessGrant>,
}

impl InMemoryGrantStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored grants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn get(&self, subject: &str, resource: &str) -> Result<Option<AccessGrant>, StoreError> {
        Ok(self
            .grants
            .get(&(subject.to_string(), resource.to_string()))
            .map(|g| g.value().clone()))
    }

    async fn upsert(&self, grant: &AccessGrant) -> Result<(), StoreError> {
        self.grants.insert(
            (grant.subject.clone(), grant.resource.clone()),
            grant.clone(),
        );
        Ok(())
    }
}
