// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Cleanup Sweeper - Background task for TTL-based container termination
//!
//! Periodically asks the registry for expired containers, claims them, and
//! drives termination through the engine. Safe under any number of
//! concurrent sweeper instances: the registry claim is the only
//! cross-worker coordination point, and every per-container failure is
//! isolated so one bad record never stops the batch.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::container::{ContainerRecord, ContainerStatus, LABEL_PARENT};
use crate::domain::engine::{ContainerEngine, EngineError};
use crate::domain::store::StoreError;
use crate::application::registry::LifecycleRegistry;

/// Termination reason recorded for sweeper-driven teardowns.
pub const REASON_TTL_EXPIRED: &str = "ttl_expired";

/// Grace period handed to the engine's stop call before it escalates.
const STOP_TIMEOUT_SECONDS: i64 = 10;

/// Configuration for the cleanup sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Whether sweeping is enabled.
    pub enabled: bool,

    /// How often to run a sweep pass (in seconds).
    pub interval_seconds: u64,

    /// Delay before the first pass after startup (in seconds).
    pub initial_delay_seconds: u64,

    /// Bounded worker pool size per pass.
    pub concurrency: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300, // Sweep every 5 minutes
            initial_delay_seconds: 5,
            concurrency: 5,
        }
    }
}

/// Per-container cleanup failure.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sidecar cleanup failed for {} of {total} sidecars: {}", failures.len(), describe_failures(failures))]
    Sidecars {
        failures: Vec<(String, EngineError)>,
        total: usize,
    },
}

fn describe_failures(failures: &[(String, EngineError)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Absorb stop errors meaning the container is already stopped or gone.
fn absorb_benign_stop(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(e) if e.is_benign_on_cleanup() => Ok(()),
        other => other,
    }
}

/// Absorb remove errors meaning the container is already gone or mid
/// teardown. Already-stopped is not an end state for a remove and stays
/// an error.
fn absorb_benign_remove(result: Result<(), EngineError>) -> Result<(), EngineError> {
    match result {
        Err(EngineError::NotFound(_) | EngineError::OperationInProgress(_)) => Ok(()),
        other => other,
    }
}

/// Cleanup Sweeper - Background task
pub struct CleanupSweeper {
    registry: Arc<LifecycleRegistry>,
    engine: Arc<dyn ContainerEngine>,
    config: SweeperConfig,
    shutdown_token: tokio_util::sync::CancellationToken,
}

impl CleanupSweeper {
    pub fn new(
        registry: Arc<LifecycleRegistry>,
        engine: Arc<dyn ContainerEngine>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            config,
            shutdown_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the sweeper background task. No-op when disabled.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Cancel the recurring timer and stop the loop.
    pub fn stop(&self) {
        self.shutdown_token.cancel();
    }

    /// Run the sweep loop with graceful shutdown support
    async fn run(&self) {
        if !self.config.enabled {
            info!("cleanup sweeper is disabled");
            return;
        }

        info!(
            interval_seconds = self.config.interval_seconds,
            concurrency = self.config.concurrency,
            "starting cleanup sweeper background task"
        );

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.config.initial_delay_seconds)) => {}
            _ = self.shutdown_token.cancelled() => {
                info!("shutdown signal received before first sweep");
                return;
            }
        }

        let mut tick = interval(Duration::from_secs(self.config.interval_seconds));

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let stopped = self.sweep(Utc::now()).await;
                    if stopped > 0 {
                        info!(stopped, "sweep pass terminated expired containers");
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("shutdown signal received, stopping cleanup sweeper");
                    break;
                }
            }
        }

        info!("cleanup sweeper background task stopped");
    }

    /// Execute a single sweep pass. Returns the number of containers fully
    /// stopped this pass. Never fails: every per-container error is
    /// converted into a scheduled retry.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = match self.registry.get_expired(now).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!(error = %e, "failed to query expired containers");
                return 0;
            }
        };

        if expired.is_empty() {
            return 0;
        }
        debug!(count = expired.len(), "processing expired containers");

        stream::iter(expired)
            .map(|record| self.sweep_one(record, now))
            .buffer_unordered(self.config.concurrency.max(1))
            .fold(0usize, |acc, stopped| async move { acc + usize::from(stopped) })
            .await
    }

    /// Drive one expired record to termination. Returns whether the record
    /// reached the stopped state this pass.
    async fn sweep_one(&self, record: ContainerRecord, now: DateTime<Utc>) -> bool {
        let id = record.container_id.as_str();

        match record.status {
            ContainerStatus::Running => {
                let claim_id = Uuid::new_v4().to_string();
                match self.registry.claim_for_termination(id, &claim_id, now).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Another worker won the race; expected, not an error.
                        debug!(container_id = %id, "lost termination claim to another worker");
                        return false;
                    }
                    Err(e) => {
                        warn!(container_id = %id, error = %e, "failed to claim container");
                        return false;
                    }
                }
            }
            // Already the owner of a prior attempt; proceed directly.
            ContainerStatus::Terminating => {}
            ContainerStatus::Stopped | ContainerStatus::Failed => return false,
        }

        match self.terminate(id).await {
            Ok(()) => match self.registry.mark_stopped(id, REASON_TTL_EXPIRED, now).await {
                Ok(()) => {
                    info!(container_id = %id, "expired container terminated");
                    true
                }
                Err(e) => {
                    warn!(container_id = %id, error = %e, "container terminated but record update failed");
                    false
                }
            },
            Err(e) => {
                warn!(container_id = %id, error = %e, "container termination failed, scheduling retry");
                if let Err(store_err) = self
                    .registry
                    .record_termination_failure(id, &e.to_string(), now)
                    .await
                {
                    warn!(container_id = %id, error = %store_err, "failed to record termination failure");
                }
                false
            }
        }
    }

    /// Tear a container down: sidecars first, then the primary stop and
    /// remove. The steps for one container are strictly sequential.
    async fn terminate(&self, id: &str) -> Result<(), CleanupError> {
        self.tear_down_sidecars(id).await?;
        absorb_benign_stop(self.engine.stop(id, STOP_TIMEOUT_SECONDS).await)?;
        absorb_benign_remove(self.engine.remove(id, true).await)?;
        Ok(())
    }

    /// Stop and remove every sidecar bound to the primary container.
    /// Individual failures are collected; an aggregate error is raised only
    /// when at least one sidecar genuinely failed.
    async fn tear_down_sidecars(&self, parent_id: &str) -> Result<(), CleanupError> {
        let filter = HashMap::from([(LABEL_PARENT.to_string(), parent_id.to_string())]);
        let sidecars = self.engine.list_by_labels(&filter, true).await?;
        if sidecars.is_empty() {
            return Ok(());
        }

        let total = sidecars.len();
        debug!(container_id = %parent_id, sidecars = total, "tearing down dependent sidecars");

        let mut failures = Vec::new();
        for sidecar in sidecars {
            if let Err(e) =
                absorb_benign_stop(self.engine.stop(&sidecar.id, STOP_TIMEOUT_SECONDS).await)
            {
                failures.push((sidecar.id, e));
                continue;
            }
            if let Err(e) = absorb_benign_remove(self.engine.remove(&sidecar.id, true).await) {
                failures.push((sidecar.id, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::Sidecars { failures, total })
        }
    }
}
