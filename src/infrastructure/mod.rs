// Copyright (c) 2026 Sandbox Fleet Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod engine;
pub mod repositories;
