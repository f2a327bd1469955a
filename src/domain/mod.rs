// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod container;
pub mod engine;
pub mod store;
