// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Label Scheme
// ============================================================================

/// Fleet-membership label key. Every container provisioned for the fleet
/// carries `fleet.role=workspace`.
pub const LABEL_ROLE: &str = "fleet.role";

/// Value of [`LABEL_ROLE`] for primary worker containers.
pub const ROLE_WORKSPACE: &str = "workspace";

/// Ownership label key. Value is the composite `<owner_node_id>__<thread_id>`.
pub const LABEL_OWNER: &str = "fleet.owner";

/// Separator inside the [`LABEL_OWNER`] composite value.
pub const OWNER_SEPARATOR: &str = "__";

/// Sidecar binding label key. Value is the container id of the primary
/// container the sidecar belongs to.
pub const LABEL_PARENT: &str = "fleet.parent";

/// Owner recorded when an ownership label is missing or unparseable.
pub const UNKNOWN_OWNER: &str = "unknown";

/// Default time-to-live for a worker container: 24 hours of inactivity.
pub const DEFAULT_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Split a composite ownership label into `(owner_node_id, thread_id)`.
///
/// Unparseable values fall back to the unknown owner so a mislabeled
/// container is still tracked rather than dropped.
pub fn parse_owner_label(value: &str) -> (String, String) {
    match value.split_once(OWNER_SEPARATOR) {
        Some((owner, thread)) if !owner.is_empty() && !thread.is_empty() => {
            (owner.to_string(), thread.to_string())
        }
        _ => (UNKNOWN_OWNER.to_string(), UNKNOWN_OWNER.to_string()),
    }
}

/// Compute the kill deadline for a container last used at `last_used_at`.
///
/// `ttl_seconds <= 0` means the container never expires.
pub fn kill_after(last_used_at: DateTime<Utc>, ttl_seconds: i64) -> Option<DateTime<Utc>> {
    if ttl_seconds > 0 {
        Some(last_used_at + Duration::seconds(ttl_seconds))
    } else {
        None
    }
}

// ============================================================================
// Value Objects
// ============================================================================

/// Container engine backing a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Docker,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "docker" => Some(Self::Docker),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container lifecycle status.
///
/// Status only moves forward: running → terminating → {stopped | failed}.
/// A terminating record may be revisited (retried) without changing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Terminating,
    Stopped,
    Failed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "terminating" => Some(Self::Terminating),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open bookkeeping attached to a [`ContainerRecord`].
///
/// `claim_id` is set only while the record is terminating and identifies the
/// worker/attempt responsible for finishing termination. `retry_after` and
/// `termination_attempts` carry the backoff state of failed terminations, so
/// a failed termination survives a sweeper restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerMetadata {
    pub labels: HashMap<String, String>,
    pub platform: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub claim_id: Option<String>,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub termination_attempts: u32,
}

// ============================================================================
// Aggregate Root: ContainerRecord
// ============================================================================

/// One durable record per physical container, keyed by `container_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    pub owner_node_id: String,
    pub thread_id: String,
    pub image: String,
    pub engine_kind: EngineKind,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub kill_after_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<String>,
    pub metadata: ContainerMetadata,
}

impl ContainerRecord {
    /// Create a fresh running record with the default TTL applied.
    pub fn new(
        container_id: impl Into<String>,
        owner_node_id: impl Into<String>,
        thread_id: impl Into<String>,
        image: impl Into<String>,
        engine_kind: EngineKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            owner_node_id: owner_node_id.into(),
            thread_id: thread_id.into(),
            image: image.into(),
            engine_kind,
            status: ContainerStatus::Running,
            created_at: now,
            updated_at: now,
            last_used_at: now,
            kill_after_at: kill_after(now, DEFAULT_TTL_SECONDS),
            deleted_at: None,
            termination_reason: None,
            metadata: ContainerMetadata::default(),
        }
    }

    /// Effective TTL in seconds: stored value, else the fleet default.
    pub fn effective_ttl(&self) -> i64 {
        self.metadata.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS)
    }

    /// Whether this record is eligible for a sweep pass at `now`.
    ///
    /// Running records expire once their kill deadline passes; terminating
    /// records become eligible again once any retry backoff has elapsed, so
    /// failed terminations self-heal without a fresh claim race.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ContainerStatus::Running => self
                .kill_after_at
                .map(|deadline| deadline <= now)
                .unwrap_or(false),
            ContainerStatus::Terminating => self
                .metadata
                .retry_after
                .map(|after| after <= now)
                .unwrap_or(true),
            ContainerStatus::Stopped | ContainerStatus::Failed => false,
        }
    }
}
