// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle Registry Application Service
//!
//! Single source of truth for the worker fleet: owns TTL arithmetic, the
//! atomic claim transition, and termination backoff bookkeeping on top of
//! the [`ContainerStore`] contract.
//!
//! All operations take an explicit `now` so the TTL clock is driven by the
//! caller and fully testable.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::container::{
    kill_after, ContainerMetadata, ContainerRecord, ContainerStatus, EngineKind,
    DEFAULT_TTL_SECONDS, UNKNOWN_OWNER,
};
use crate::domain::store::{ContainerStore, StoreError};

/// Retry backoff is capped at 15 minutes.
const MAX_BACKOFF_SECONDS: i64 = 15 * 60;

/// Exponential backoff for termination retries: `min(2^attempts s, 15 min)`.
fn termination_backoff(attempts: u32) -> Duration {
    // 2^10 s is already past the cap; clamp the exponent before shifting.
    let secs = (1i64 << attempts.min(10)).min(MAX_BACKOFF_SECONDS);
    Duration::seconds(secs)
}

/// Parameters for [`LifecycleRegistry::register_start`].
#[derive(Debug, Clone)]
pub struct RegisterStart {
    pub container_id: String,
    pub owner_node_id: String,
    pub thread_id: String,
    pub image: String,
    pub engine_kind: EngineKind,
    /// `None` applies the fleet default; `<= 0` means never expires.
    pub ttl_seconds: Option<i64>,
    pub labels: HashMap<String, String>,
    pub platform: Option<String>,
}

pub struct LifecycleRegistry {
    store: Arc<dyn ContainerStore>,
}

impl LifecycleRegistry {
    pub fn new(store: Arc<dyn ContainerStore>) -> Self {
        Self { store }
    }

    /// Upsert a freshly provisioned container as running.
    ///
    /// Preserves the original `created_at` across re-registration and
    /// resets termination bookkeeping from any previous lifecycle.
    pub async fn register_start(
        &self,
        request: RegisterStart,
        now: DateTime<Utc>,
    ) -> Result<ContainerRecord, StoreError> {
        let existing = self.store.get(&request.container_id).await?;
        let created_at = existing.map(|r| r.created_at).unwrap_or(now);

        let record = ContainerRecord {
            container_id: request.container_id,
            owner_node_id: request.owner_node_id,
            thread_id: request.thread_id,
            image: request.image,
            engine_kind: request.engine_kind,
            status: ContainerStatus::Running,
            created_at,
            updated_at: now,
            last_used_at: now,
            kill_after_at: kill_after(now, request.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS)),
            deleted_at: None,
            termination_reason: None,
            metadata: ContainerMetadata {
                labels: request.labels,
                platform: request.platform,
                ttl_seconds: request.ttl_seconds,
                ..ContainerMetadata::default()
            },
        };

        self.store.put(&record).await?;
        info!(
            container_id = %record.container_id,
            owner_node_id = %record.owner_node_id,
            "registered running container"
        );
        Ok(record)
    }

    /// Record a use of the container and recompute its kill deadline.
    ///
    /// An unknown id gets a minimal placeholder record rather than dropping
    /// the update, so TTL tracking survives registry drift.
    pub async fn touch_last_used(
        &self,
        id: &str,
        now: DateTime<Utc>,
        ttl_override: Option<i64>,
    ) -> Result<ContainerRecord, StoreError> {
        let mut record = match self.store.get(id).await? {
            Some(record) => record,
            None => {
                debug!(container_id = %id, "touch for unknown container, creating placeholder");
                ContainerRecord::new(id, UNKNOWN_OWNER, UNKNOWN_OWNER, UNKNOWN_OWNER, EngineKind::Docker, now)
            }
        };

        let ttl = ttl_override.unwrap_or_else(|| record.effective_ttl());
        record.last_used_at = now;
        record.updated_at = now;
        record.kill_after_at = kill_after(now, ttl);
        if ttl_override.is_some() {
            record.metadata.ttl_seconds = ttl_override;
        }

        self.store.put(&record).await?;
        Ok(record)
    }

    /// Atomically claim a running container for termination.
    ///
    /// The sole cross-worker mutual-exclusion primitive: at most one of any
    /// number of concurrent sweep workers can win the claim for a record.
    pub async fn claim_for_termination(
        &self,
        id: &str,
        claim_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.store.claim_for_termination(id, claim_id, now).await
    }

    /// Bookkeeping transition to terminating outside the claim path, e.g.
    /// for explicitly requested teardowns.
    pub async fn mark_terminating(
        &self,
        id: &str,
        reason: &str,
        claim_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        record.status = ContainerStatus::Terminating;
        record.termination_reason = Some(reason.to_string());
        if let Some(claim_id) = claim_id {
            record.metadata.claim_id = Some(claim_id.to_string());
        }
        record.updated_at = now;
        self.store.put(&record).await
    }

    /// Terminal transition after a successful teardown.
    pub async fn mark_stopped(
        &self,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        record.status = ContainerStatus::Stopped;
        record.termination_reason = Some(reason.to_string());
        record.deleted_at = Some(now);
        record.updated_at = now;
        self.store.put(&record).await?;
        info!(container_id = %id, reason, "container stopped");
        Ok(())
    }

    /// Schedule a retry after a failed termination attempt.
    ///
    /// The status stays terminating, so the record remains claimed and no
    /// other worker races it; it becomes sweep-eligible again once the
    /// backoff elapses.
    pub async fn record_termination_failure(
        &self,
        id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let attempts = record.metadata.termination_attempts;
        let delay = termination_backoff(attempts);
        record.metadata.retry_after = Some(now + delay);
        record.metadata.termination_attempts = attempts + 1;
        record.metadata.last_error = Some(message.to_string());
        record.updated_at = now;

        self.store.put(&record).await?;
        debug!(
            container_id = %id,
            attempts = attempts + 1,
            retry_in_seconds = delay.num_seconds(),
            "termination failed, retry scheduled"
        );
        Ok(())
    }

    /// Records eligible for the next sweep pass.
    pub async fn get_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        self.store.find_expired(now).await
    }

    /// All tracked records.
    pub async fn list_all(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        self.store.list_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemoryContainerStore;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn registry() -> (LifecycleRegistry, Arc<InMemoryContainerStore>) {
        let store = Arc::new(InMemoryContainerStore::new());
        (LifecycleRegistry::new(store.clone()), store)
    }

    fn register(id: &str, ttl_seconds: Option<i64>) -> RegisterStart {
        RegisterStart {
            container_id: id.to_string(),
            owner_node_id: "node-1".to_string(),
            thread_id: "thread-1".to_string(),
            image: "sandbox:latest".to_string(),
            engine_kind: EngineKind::Docker,
            ttl_seconds,
            labels: HashMap::new(),
            platform: None,
        }
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut previous = Duration::zero();
        for attempts in 0..20 {
            let delay = termination_backoff(attempts);
            assert!(delay >= previous, "backoff decreased at attempt {attempts}");
            assert!(delay <= Duration::seconds(MAX_BACKOFF_SECONDS));
            previous = delay;
        }
        assert_eq!(termination_backoff(0), Duration::seconds(1));
        assert_eq!(termination_backoff(3), Duration::seconds(8));
        assert_eq!(termination_backoff(30), Duration::seconds(MAX_BACKOFF_SECONDS));
    }

    #[tokio::test]
    async fn register_then_touch_extends_deadline() {
        let (registry, _) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();

        let record = registry
            .touch_last_used("a", t0() + Duration::seconds(30), None)
            .await
            .unwrap();

        assert_eq!(record.kill_after_at, Some(t0() + Duration::seconds(90)));
        assert_eq!(record.last_used_at, t0() + Duration::seconds(30));
    }

    #[tokio::test]
    async fn non_positive_ttl_registers_without_deadline() {
        let (registry, _) = registry();
        let record = registry.register_start(register("a", Some(0)), t0()).await.unwrap();
        assert_eq!(record.kill_after_at, None);

        let record = registry.register_start(register("b", Some(-1)), t0()).await.unwrap();
        assert_eq!(record.kill_after_at, None);
    }

    #[tokio::test]
    async fn default_ttl_applied_when_unspecified() {
        let (registry, _) = registry();
        let record = registry.register_start(register("a", None), t0()).await.unwrap();
        assert_eq!(
            record.kill_after_at,
            Some(t0() + Duration::seconds(crate::domain::container::DEFAULT_TTL_SECONDS))
        );
    }

    #[tokio::test]
    async fn reregistration_preserves_created_at() {
        let (registry, _) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        let later = t0() + Duration::hours(1);
        let record = registry.register_start(register("a", Some(60)), later).await.unwrap();

        assert_eq!(record.created_at, t0());
        assert_eq!(record.last_used_at, later);
        assert_eq!(record.metadata.termination_attempts, 0);
    }

    #[tokio::test]
    async fn touch_unknown_id_creates_placeholder() {
        let (registry, store) = registry();
        registry.touch_last_used("ghost", t0(), Some(120)).await.unwrap();

        let record = store.get("ghost").await.unwrap().unwrap();
        assert_eq!(record.owner_node_id, UNKNOWN_OWNER);
        assert_eq!(record.status, ContainerStatus::Running);
        assert_eq!(record.kill_after_at, Some(t0() + Duration::seconds(120)));
    }

    #[tokio::test]
    async fn touch_ttl_override_wins_over_stored_ttl() {
        let (registry, _) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();

        let record = registry
            .touch_last_used("a", t0() + Duration::seconds(10), Some(600))
            .await
            .unwrap();
        assert_eq!(record.kill_after_at, Some(t0() + Duration::seconds(610)));

        // The override becomes the stored ttl for subsequent touches.
        let record = registry
            .touch_last_used("a", t0() + Duration::seconds(20), None)
            .await
            .unwrap();
        assert_eq!(record.kill_after_at, Some(t0() + Duration::seconds(620)));
    }

    #[tokio::test]
    async fn claim_is_exactly_once_under_concurrency() {
        let (registry, _) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        let registry = Arc::new(registry);

        let mut handles = Vec::new();
        for worker in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .claim_for_termination("a", &format!("claim-{worker}"), t0())
                    .await
                    .unwrap()
            }));
        }

        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn claim_fails_for_non_running_record() {
        let (registry, store) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        assert!(registry.claim_for_termination("a", "c1", t0()).await.unwrap());

        // Already terminating: a second claim loses.
        assert!(!registry.claim_for_termination("a", "c2", t0()).await.unwrap());

        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ContainerStatus::Terminating);
        assert_eq!(record.metadata.claim_id.as_deref(), Some("c1"));

        // Missing records cannot be claimed either.
        assert!(!registry.claim_for_termination("ghost", "c3", t0()).await.unwrap());
    }

    #[tokio::test]
    async fn termination_failure_schedules_backoff() {
        let (registry, store) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        registry.claim_for_termination("a", "c1", t0()).await.unwrap();

        registry
            .record_termination_failure("a", "engine exploded", t0())
            .await
            .unwrap();

        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ContainerStatus::Terminating);
        assert_eq!(record.metadata.termination_attempts, 1);
        assert_eq!(record.metadata.retry_after, Some(t0() + Duration::seconds(1)));
        assert_eq!(record.metadata.last_error.as_deref(), Some("engine exploded"));

        registry
            .record_termination_failure("a", "still broken", t0())
            .await
            .unwrap();
        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.metadata.termination_attempts, 2);
        assert_eq!(record.metadata.retry_after, Some(t0() + Duration::seconds(2)));
    }

    #[tokio::test]
    async fn get_expired_honors_retry_backoff() {
        let (registry, _) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        registry.claim_for_termination("a", "c1", t0()).await.unwrap();
        registry
            .record_termination_failure("a", "boom", t0())
            .await
            .unwrap();

        // retry_after = t0 + 1s; not expired before that.
        assert!(registry.get_expired(t0()).await.unwrap().is_empty());

        let expired = registry
            .get_expired(t0() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].container_id, "a");
        // Same terminating record, no fresh claim race needed.
        assert_eq!(expired[0].status, ContainerStatus::Terminating);
    }

    #[tokio::test]
    async fn get_expired_selects_running_past_deadline() {
        let (registry, _) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        registry.register_start(register("b", Some(3600)), t0()).await.unwrap();
        registry.register_start(register("c", Some(0)), t0()).await.unwrap();

        let expired = registry
            .get_expired(t0() + Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].container_id, "a");
    }

    #[tokio::test]
    async fn mark_stopped_sets_deleted_at() {
        let (registry, store) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        registry.mark_stopped("a", "ttl_expired", t0()).await.unwrap();

        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ContainerStatus::Stopped);
        assert_eq!(record.deleted_at, Some(t0()));
        assert_eq!(record.termination_reason.as_deref(), Some("ttl_expired"));
    }

    #[tokio::test]
    async fn mark_terminating_stamps_reason_and_claim() {
        let (registry, store) = registry();
        registry.register_start(register("a", Some(60)), t0()).await.unwrap();
        registry
            .mark_terminating("a", "requested", Some("manual-1"), t0())
            .await
            .unwrap();

        let record = store.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, ContainerStatus::Terminating);
        assert_eq!(record.termination_reason.as_deref(), Some("requested"));
        assert_eq!(record.metadata.claim_id.as_deref(), Some("manual-1"));
    }
}
