// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Engine Backfill Application Service
//!
//! Reconciliation job that re-derives registry state from the container
//! engine's ground truth, typically on startup. Imports every container
//! carrying the fleet-membership label without clobbering well-formed
//! registry state: an existing `last_used_at`/`kill_after_at` pair is left
//! untouched, and a missing kill deadline is recomputed from the *existing*
//! `last_used_at` rather than from now, so an already-idle container is not
//! granted extra life.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::container::{
    kill_after, parse_owner_label, ContainerMetadata, ContainerRecord, ContainerStatus,
    EngineKind, LABEL_OWNER, LABEL_ROLE, ROLE_WORKSPACE,
};
use crate::domain::engine::{ContainerEngine, EngineContainerSummary};
use crate::domain::store::ContainerStore;

/// Default bounded worker pool size for the per-container import.
pub const DEFAULT_BACKFILL_CONCURRENCY: usize = 5;

pub struct EngineBackfill {
    store: Arc<dyn ContainerStore>,
    engine: Arc<dyn ContainerEngine>,
    concurrency: usize,
}

impl EngineBackfill {
    pub fn new(store: Arc<dyn ContainerStore>, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            store,
            engine,
            concurrency: DEFAULT_BACKFILL_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Import engine ground truth into the registry. Per-item failures are
    /// logged and skipped; only the initial listing can fail the run.
    /// Returns the number of containers imported.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let filter = HashMap::from([(LABEL_ROLE.to_string(), ROLE_WORKSPACE.to_string())]);
        let summaries = self
            .engine
            .list_by_labels(&filter, true)
            .await
            .context("listing fleet containers from the engine")?;

        info!(count = summaries.len(), "backfilling registry from engine state");

        let imported = stream::iter(summaries)
            .map(|summary| async move {
                let id = summary.id.clone();
                match self.backfill_one(summary, now).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(container_id = %id, error = %e, "skipping container during backfill");
                        false
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .fold(0usize, |acc, ok| async move { acc + usize::from(ok) })
            .await;

        info!(imported, "engine backfill complete");
        Ok(imported)
    }

    async fn backfill_one(&self, summary: EngineContainerSummary, now: DateTime<Utc>) -> Result<()> {
        let inspected = self.engine.inspect(&summary.id).await?;

        let record = match self.store.get(&summary.id).await? {
            Some(existing) => self.merge_existing(existing, &inspected.image, now),
            None => Self::seed_fresh(&summary, inspected.running, inspected.created_at, inspected.image, now),
        };

        self.store.put(&record).await?;
        debug!(container_id = %record.container_id, status = %record.status, "backfilled container record");
        Ok(())
    }

    /// Repair an existing record without disturbing well-formed state or the
    /// termination bookkeeping (`last_error`, `retry_after`, attempt count).
    fn merge_existing(
        &self,
        mut record: ContainerRecord,
        image: &Option<String>,
        now: DateTime<Utc>,
    ) -> ContainerRecord {
        if let Some(image) = image {
            record.image = image.clone();
        }
        if record.kill_after_at.is_none() {
            let ttl = record.effective_ttl();
            // Recompute from the existing last_used_at, never from now.
            record.kill_after_at = kill_after(record.last_used_at, ttl);
        }
        record.updated_at = now;
        record
    }

    /// Seed a record the registry has never seen. Running containers start
    /// their TTL clock at now; stopped ones at the engine's creation time.
    fn seed_fresh(
        summary: &EngineContainerSummary,
        running: bool,
        created_at: Option<DateTime<Utc>>,
        image: Option<String>,
        now: DateTime<Utc>,
    ) -> ContainerRecord {
        let (owner_node_id, thread_id) = parse_owner_label(
            summary
                .labels
                .get(LABEL_OWNER)
                .map(String::as_str)
                .unwrap_or_default(),
        );
        let created_at = created_at.unwrap_or(now);
        let last_used_at = if running { now } else { created_at };

        ContainerRecord {
            container_id: summary.id.clone(),
            owner_node_id,
            thread_id,
            image: image.unwrap_or_default(),
            engine_kind: EngineKind::Docker,
            status: if running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Stopped
            },
            created_at,
            updated_at: now,
            last_used_at,
            kill_after_at: kill_after(last_used_at, crate::domain::container::DEFAULT_TTL_SECONDS),
            deleted_at: None,
            termination_reason: None,
            metadata: ContainerMetadata {
                labels: summary.labels.clone(),
                ..ContainerMetadata::default()
            },
        }
    }
}
