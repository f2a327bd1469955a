// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Container Store
//!
//! Provides the PostgreSQL store implementation for container records.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements the `ContainerStore` contract over one
//!   `containers` table keyed by `container_id`, with secondary indexes on
//!   `(status, kill_after_at)` for expiry scans and
//!   `(owner_node_id, status, last_used_at)` for per-owner queries.
//!
//! The claim transition is a single conditional `UPDATE ... WHERE
//! status = 'running'`, so mutual exclusion holds across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::container::{
    ContainerMetadata, ContainerRecord, ContainerStatus, EngineKind,
};
use crate::domain::store::{ContainerStore, StoreError};

pub struct PostgresContainerStore {
    pool: PgPool,
}

impl PostgresContainerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Install the table and its lookup indexes when missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                container_id        TEXT PRIMARY KEY,
                owner_node_id       TEXT NOT NULL,
                thread_id           TEXT NOT NULL,
                image               TEXT NOT NULL,
                engine_kind         TEXT NOT NULL,
                status              TEXT NOT NULL,
                created_at          TIMESTAMPTZ NOT NULL,
                updated_at          TIMESTAMPTZ NOT NULL,
                last_used_at        TIMESTAMPTZ NOT NULL,
                kill_after_at       TIMESTAMPTZ,
                deleted_at          TIMESTAMPTZ,
                termination_reason  TEXT,
                metadata            JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to create containers table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_containers_status_kill_after \
             ON containers (status, kill_after_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_containers_owner_status_last_used \
             ON containers (owner_node_id, status, last_used_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl ContainerStore for PostgresContainerStore {
    async fn get(&self, id: &str) -> Result<Option<ContainerRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                container_id, owner_node_id, thread_id, image, engine_kind,
                status, created_at, updated_at, last_used_at, kill_after_at,
                deleted_at, termination_reason, metadata
            FROM containers
            WHERE container_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(parse_container_row).transpose()
    }

    async fn put(&self, record: &ContainerRecord) -> Result<(), StoreError> {
        let metadata_json = serde_json::to_value(&record.metadata)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO containers (
                container_id, owner_node_id, thread_id, image, engine_kind,
                status, created_at, updated_at, last_used_at, kill_after_at,
                deleted_at, termination_reason, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (container_id) DO UPDATE SET
                owner_node_id = EXCLUDED.owner_node_id,
                thread_id = EXCLUDED.thread_id,
                image = EXCLUDED.image,
                engine_kind = EXCLUDED.engine_kind,
                status = EXCLUDED.status,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                last_used_at = EXCLUDED.last_used_at,
                kill_after_at = EXCLUDED.kill_after_at,
                deleted_at = EXCLUDED.deleted_at,
                termination_reason = EXCLUDED.termination_reason,
                metadata = EXCLUDED.metadata
            "#,
        )
        .bind(&record.container_id)
        .bind(&record.owner_node_id)
        .bind(&record.thread_id)
        .bind(&record.image)
        .bind(record.engine_kind.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.last_used_at)
        .bind(record.kill_after_at)
        .bind(record.deleted_at)
        .bind(&record.termination_reason)
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(format!("failed to save container record: {e}")))?;

        Ok(())
    }

    async fn claim_for_termination(
        &self,
        id: &str,
        claim_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET status = 'terminating',
                metadata = jsonb_set(metadata, '{claim_id}', to_jsonb($2::text)),
                updated_at = $3
            WHERE container_id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(claim_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<ContainerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                container_id, owner_node_id, thread_id, image, engine_kind,
                status, created_at, updated_at, last_used_at, kill_after_at,
                deleted_at, termination_reason, metadata
            FROM containers
            WHERE (status = 'running' AND kill_after_at IS NOT NULL AND kill_after_at <= $1)
               OR (status = 'terminating'
                   AND (metadata->>'retry_after' IS NULL
                        OR (metadata->>'retry_after')::timestamptz <= $1))
            ORDER BY kill_after_at ASC NULLS LAST
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter().map(parse_container_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                container_id, owner_node_id, thread_id, image, engine_kind,
                status, created_at, updated_at, last_used_at, kill_after_at,
                deleted_at, termination_reason, metadata
            FROM containers
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter().map(parse_container_row).collect()
    }
}

/// Parse a container record from a database row
fn parse_container_row(row: sqlx::postgres::PgRow) -> Result<ContainerRecord, StoreError> {
    let container_id: String = row.get("container_id");
    let owner_node_id: String = row.get("owner_node_id");
    let thread_id: String = row.get("thread_id");
    let image: String = row.get("image");
    let engine_kind_raw: String = row.get("engine_kind");
    let status_raw: String = row.get("status");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");
    let last_used_at: DateTime<Utc> = row.get("last_used_at");
    let kill_after_at: Option<DateTime<Utc>> = row.get("kill_after_at");
    let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
    let termination_reason: Option<String> = row.get("termination_reason");
    let metadata_val: serde_json::Value = row.get("metadata");

    let engine_kind = EngineKind::parse(&engine_kind_raw).ok_or_else(|| {
        StoreError::Serialization(format!("unknown engine kind: {engine_kind_raw}"))
    })?;
    let status = ContainerStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status: {status_raw}")))?;
    let metadata: ContainerMetadata = serde_json::from_value(metadata_val)
        .map_err(|e| StoreError::Serialization(format!("failed to deserialize metadata: {e}")))?;

    Ok(ContainerRecord {
        container_id,
        owner_node_id,
        thread_id,
        image,
        engine_kind,
        status,
        created_at,
        updated_at,
        last_used_at,
        kill_after_at,
        deleted_at,
        termination_reason,
        metadata,
    })
}
