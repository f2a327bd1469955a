// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod postgres;

pub use postgres::PostgresContainerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::container::{ContainerRecord, ContainerStatus};
use crate::domain::store::{ContainerStore, StoreError};

/// In-memory store for development and testing. One mutex guards the map,
/// so the claim transition is atomic within the process.
#[derive(Clone, Default)]
pub struct InMemoryContainerStore {
    records: Arc<Mutex<HashMap<String, ContainerRecord>>>,
}

impl InMemoryContainerStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ContainerStore for InMemoryContainerStore {
    async fn get(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Database("mutex poisoned".to_string()))?;
        Ok(records.get(id).cloned())
    }

    async fn put(&self, record: &ContainerRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Database("mutex poisoned".to_string()))?;
        records.insert(record.container_id.clone(), record.clone());
        Ok(())
    }

    async fn claim_for_termination(
        &self,
        id: &str,
        claim_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Database("mutex poisoned".to_string()))?;

        match records.get_mut(id) {
            Some(record) if record.status == ContainerStatus::Running => {
                record.status = ContainerStatus::Terminating;
                record.metadata.claim_id = Some(claim_id.to_string());
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<ContainerRecord>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Database("mutex poisoned".to_string()))?;

        let mut expired: Vec<ContainerRecord> = records
            .values()
            .filter(|record| record.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|record| record.kill_after_at);
        Ok(expired)
    }

    async fn list_all(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::Database("mutex poisoned".to_string()))?;
        Ok(records.values().cloned().collect())
    }
}
