// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! Lifecycle core for the sandboxed worker fleet: a durable registry of
//! container state with TTL tracking, a periodic cleanup sweeper, an
//! engine-state reconciliation job, and a command-execution supervisor.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Implements lib

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
