// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Container Store Contract
//!
//! Persistence contract for the [`ContainerRecord`] aggregate, following the
//! repository pattern: interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|-----------------|
//! | `ContainerStore` | `ContainerRecord` | `InMemoryContainerStore`, `PostgresContainerStore` |
//!
//! The claim transition lives on the store so each backend can express it as
//! a single atomic conditional update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::container::ContainerRecord;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("container record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Persistence contract for container records.
///
/// Every mutation is a single-record, single-operation update; each
/// container's state machine evolves independently, so no multi-record
/// transactions exist.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Fetch a record by container id.
    async fn get(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError>;

    /// Insert or replace a record (keyed by container id).
    async fn put(&self, record: &ContainerRecord) -> Result<(), StoreError>;

    /// Atomic conditional claim: terminating with `claim_id` stamped, but
    /// only if the record is currently running. Returns whether this caller
    /// won the claim. At most one concurrent caller can succeed per record.
    async fn claim_for_termination(
        &self,
        id: &str,
        claim_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Records eligible for a sweep pass: running past their kill deadline,
    /// or terminating with no pending retry backoff.
    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<ContainerRecord>, StoreError>;

    /// All records, for operational listings.
    async fn list_all(&self) -> Result<Vec<ContainerRecord>, StoreError>;
}
