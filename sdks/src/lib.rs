// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lodge Rust SDK
//!
//! Talks to a Lodge daemon over its REST API and attaches to the websocket
//! channels of its operations.

pub mod client;
pub mod migration;
pub mod types;

pub use client::LodgeClient;
pub use migration::{migrate, MigrationOutcome};
pub use types::*;
