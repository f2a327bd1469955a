// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Configuration
//!
//! Defines the YAML configuration schema for the fleet lifecycle service:
//! - Container engine connection (socket path)
//! - Record storage backend (in-memory or PostgreSQL)
//! - Cleanup sweeper cadence

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::application::SweeperConfig;

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Container engine connection settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Record storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cleanup sweeper settings
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the engine socket. Defaults to the platform socket
    /// ("/var/run/docker.sock" on Unix) when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Non-durable store, for tests and single-process deployments
    Memory,
    /// Durable PostgreSQL store
    Postgres {
        /// Connection string, e.g. "postgres://fleet@localhost/fleet"
        connection_string: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl FleetConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let StorageConfig::Postgres { connection_string } = &self.storage {
            if connection_string.is_empty() {
                anyhow::bail!("storage.connection_string cannot be empty");
            }
        }
        if self.sweeper.interval_seconds == 0 {
            anyhow::bail!("sweeper.interval_seconds must be at least 1");
        }
        Ok(())
    }
}
