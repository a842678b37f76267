// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operation Domain Types
//!
//! Identity, class, status state machine and the rendered wire view of a
//! server-tracked asynchronous unit of work.
//!
//! # State Machine
//!
//! ```text
//! Pending ──► Running ──► Success | Failure | Cancelled
//!    │           │
//!    │           └──► Cancelling ──► Cancelled | Failure
//!    └──► Cancelled
//! ```
//!
//! Status codes are kept numerically compatible with existing clients:
//! every code at or above 200 is final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// REST API version prefix used in operation and resource URLs.
pub const API_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// URL of this operation under the versioned API.
    pub fn url(&self) -> String {
        format!("/{}/operations/{}", API_VERSION, self.0)
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Background work polled by the client.
    Task,
    /// Work that exchanges data over websocket channels.
    Websocket,
    /// A credential that lives until used or cancelled; never runs.
    Token,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationClass::Task => "task",
            OperationClass::Websocket => "websocket",
            OperationClass::Token => "token",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Running,
    Cancelling,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    /// Numeric wire code.
    pub fn code(&self) -> u16 {
        match self {
            OperationStatus::Running => 103,
            OperationStatus::Cancelling => 104,
            OperationStatus::Pending => 105,
            OperationStatus::Success => 200,
            OperationStatus::Failure => 400,
            OperationStatus::Cancelled => 401,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            103 => Some(OperationStatus::Running),
            104 => Some(OperationStatus::Cancelling),
            105 => Some(OperationStatus::Pending),
            200 => Some(OperationStatus::Success),
            400 => Some(OperationStatus::Failure),
            401 => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states. Decided structurally; the numeric code agrees.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failure | OperationStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Cancelled)
                | (Running, Cancelling)
                | (Cancelling, Cancelled)
                | (Cancelling, Failure)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "Pending",
            OperationStatus::Running => "Running",
            OperationStatus::Cancelling => "Cancelling",
            OperationStatus::Success => "Success",
            OperationStatus::Failure => "Failure",
            OperationStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Rendered operation as returned over the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationView {
    pub id: OperationId,
    pub class: OperationClass,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub status_code: u16,
    #[serde(default)]
    pub resources: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub may_cancel: bool,
    #[serde(default)]
    pub err: String,
}

impl OperationView {
    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// String value stored under `key` in the metadata, if any.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Operation {0} doesn't exist")]
    NotFound(OperationId),
    #[error("Only pending operations can be started")]
    NotPending,
    #[error("Operation can't be cancelled in state {0}")]
    NotCancellable(OperationStatus),
    #[error("Only websocket operations can be connected")]
    NotWebsocket,
    #[error("Only running operations can be connected")]
    NotRunning,
    #[error("Operations cannot be updated after they have completed")]
    Completed,
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("Invalid operation definition: {0}")]
    InvalidDefinition(String),
    #[error("Timed out waiting for operation {0}")]
    Timeout(OperationId),
    #[error("Daemon is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Channel(#[from] crate::domain::channel::ChannelError),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OperationStatus; 6] = [
        OperationStatus::Pending,
        OperationStatus::Running,
        OperationStatus::Cancelling,
        OperationStatus::Success,
        OperationStatus::Failure,
        OperationStatus::Cancelled,
    ];

    #[test]
    fn test_final_states_have_no_successor() {
        for from in ALL.iter().filter(|s| s.is_final()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_final_matches_code_convention() {
        for status in ALL {
            assert_eq!(status.is_final(), status.code() >= 200);
            assert_eq!(OperationStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_pending_cannot_jump_to_success() {
        assert!(!OperationStatus::Pending.can_transition_to(OperationStatus::Success));
        assert!(!OperationStatus::Pending.can_transition_to(OperationStatus::Cancelling));
        assert!(OperationStatus::Pending.can_transition_to(OperationStatus::Cancelled));
    }

    #[test]
    fn test_operation_id_roundtrip() {
        let id = OperationId::new();
        let parsed: OperationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.url(), format!("/1.0/operations/{}", id));
    }
}
