// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod backfill;
pub mod exec;
pub mod registry;
pub mod sweeper;

// Re-export services for convenience
pub use backfill::EngineBackfill;
pub use exec::{ExecError, ExecOptions, ExecOutput, ExecSupervisor, InteractiveExec, InteractiveOptions};
pub use registry::{LifecycleRegistry, RegisterStart};
pub use sweeper::{CleanupError, CleanupSweeper, SweeperConfig};
