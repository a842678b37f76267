// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Pure types, invariants and seams of the daemon core.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Operations, channels, migration negotiation, idmaps, instances

pub mod channel;
pub mod events;
pub mod exec;
pub mod idmap;
pub mod instance;
pub mod migration;
pub mod node_config;
pub mod operation;
pub mod remap;
pub mod repository;
pub mod response;
