// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod channels;
pub mod exec;
pub mod idmap_allocator;
pub mod instance_service;
pub mod loopback;
pub mod migration;
pub mod operations;

// Re-export the services the binary wires together
pub use idmap_allocator::IdmapAllocator;
pub use instance_service::{CreateInstanceRequest, InstanceService};
pub use migration::{MigrationController, MigrationSettings, TransportSet};
pub use operations::{OperationContext, OperationRegistry, OperationRequest, OperationTask};
