// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lodge Core
//!
//! Operation engine, websocket channel binding, the migration protocol and
//! idmap allocation/remapping for the Lodge daemon.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Everything the daemon binary and the SDK share

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
