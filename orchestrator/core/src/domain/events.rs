// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::operation::{OperationClass, OperationId, OperationStatus, OperationView};
use crate::domain::remap::RemapReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation lifecycle events, published on every create, status change and
/// metadata change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationEvent {
    Created {
        operation: OperationView,
        created_at: DateTime<Utc>,
    },
    StatusChanged {
        operation_id: OperationId,
        class: OperationClass,
        from: OperationStatus,
        to: OperationStatus,
        changed_at: DateTime<Utc>,
    },
    MetadataUpdated {
        operation_id: OperationId,
        metadata: serde_json::Map<String, serde_json::Value>,
        updated_at: DateTime<Utc>,
    },
    Removed {
        operation_id: OperationId,
        removed_at: DateTime<Utc>,
    },
}

impl OperationEvent {
    pub fn operation_id(&self) -> OperationId {
        match self {
            OperationEvent::Created { operation, .. } => operation.id,
            OperationEvent::StatusChanged { operation_id, .. }
            | OperationEvent::MetadataUpdated { operation_id, .. }
            | OperationEvent::Removed { operation_id, .. } => *operation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstanceEvent {
    Created {
        name: String,
        isolated: bool,
        created_at: DateTime<Utc>,
    },
    Started {
        name: String,
        started_at: DateTime<Utc>,
    },
    Deleted {
        name: String,
        deleted_at: DateTime<Utc>,
    },
    Remapped {
        name: String,
        report: RemapReport,
        remapped_at: DateTime<Utc>,
    },
    MigrationReceived {
        name: String,
        operation_id: OperationId,
        received_at: DateTime<Utc>,
    },
}
