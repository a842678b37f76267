// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure
//!
//! Adapters behind the domain seams: event bus, instance repositories,
//! websocket channels, the migration wire format, rsync, host id pool
//! discovery, ownership shifting and host processes.

pub mod channel_io;
pub mod event_bus;
pub mod host_idmap;
pub mod migration_proto;
pub mod process;
pub mod repositories;
pub mod rsync;
pub mod shift;
pub mod websocket;

pub use event_bus::{DomainEvent, EventBus};
