// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Container Engine Contract
//!
//! Narrow interface over the container engine, defined in the domain layer
//! and implemented in `crate::infrastructure::engine`. The lifecycle core
//! depends only on this surface, never on a full engine SDK.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implements the engine contract and its error taxonomy

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWrite;

/// Closed engine error taxonomy.
///
/// Benign variants mean the desired end-state was already reached and are
/// absorbed during cleanup instead of being retried as failures. The single
/// [`EngineError::is_benign_on_cleanup`] classifier replaces scattered
/// status-code comparisons at call sites.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already stopped: {0}")]
    AlreadyStopped(String),

    #[error("operation already in progress for container: {0}")]
    OperationInProgress(String),

    #[error("failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("failed to connect to container engine: {0}")]
    Connection(String),

    #[error("engine request failed: {0}")]
    Api(String),
}

impl EngineError {
    /// True when the error means the cleanup target is already gone or on
    /// its way there: already-stopped, not-found, operation-in-progress.
    pub fn is_benign_on_cleanup(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AlreadyStopped(_) | Self::OperationInProgress(_)
        )
    }
}

/// Request to create and start a worker container.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerSpec {
    /// Container name; a generated `workspace-<uuid>` name when `None`.
    pub name: Option<String>,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub platform: Option<String>,
    /// Entry command; a keep-alive command when `None` so the container
    /// idles between exec calls.
    pub cmd: Option<Vec<String>>,
}

/// Ground truth about a container, as reported by the engine.
#[derive(Debug, Clone)]
pub struct EngineContainer {
    pub id: String,
    pub running: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub image: Option<String>,
    pub labels: HashMap<String, String>,
}

/// One entry from a label-filtered container listing.
#[derive(Debug, Clone)]
pub struct EngineContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Request to start an exec inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    /// With a pseudo-terminal only one combined stream exists; it is
    /// reported entirely as stdout.
    pub tty: bool,
    pub attach_stdin: bool,
}

/// One demultiplexed chunk of exec output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

impl ExecChunk {
    pub fn as_bytes(&self) -> &Bytes {
        match self {
            Self::Stdout(b) | Self::Stderr(b) => b,
        }
    }
}

/// Live handle to a started exec: a demultiplexed output stream and, when
/// stdin was attached, a writable input half. Dropping the handle tears the
/// underlying channel down.
pub struct ExecHandle {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<ExecChunk, EngineError>>,
    pub input: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHandle")
            .field("exec_id", &self.exec_id)
            .field("input", &self.input.is_some())
            .finish()
    }
}

/// Narrow engine client surface consumed by the lifecycle core.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Make sure `image` is available locally, pulling it when missing.
    async fn ensure_image(&self, image: &str, platform: Option<&str>) -> Result<(), EngineError>;

    /// Create a container from `spec` and start it. Returns the engine's
    /// container id.
    async fn create_and_start(&self, spec: CreateContainerSpec) -> Result<String, EngineError>;

    /// Inspect real container state.
    async fn inspect(&self, id: &str) -> Result<EngineContainer, EngineError>;

    /// Start an exec attached to stdout/stderr (and optionally stdin).
    async fn exec(&self, id: &str, request: ExecRequest) -> Result<ExecHandle, EngineError>;

    /// Exit code of a finished exec; `None` while it is still running.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<Option<i64>, EngineError>;

    /// Gracefully stop a container, escalating after `timeout_seconds`.
    async fn stop(&self, id: &str, timeout_seconds: i64) -> Result<(), EngineError>;

    /// Remove a container.
    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// List containers matching every given label, including stopped ones
    /// when `all` is set.
    async fn list_by_labels(
        &self,
        labels: &HashMap<String, String>,
        all: bool,
    ) -> Result<Vec<EngineContainerSummary>, EngineError>;

    /// Labels attached to a container.
    async fn get_labels(&self, id: &str) -> Result<HashMap<String, String>, EngineError>;
}
