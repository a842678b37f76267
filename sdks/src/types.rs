// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Types
//!
//! Request and response types shared with the daemon, plus the client error.

use thiserror::Error;

pub use lodge_core::application::CreateInstanceRequest;
pub use lodge_core::domain::channel::{ChannelConn, ChannelError, RemoteOperation};
pub use lodge_core::domain::exec::{ExecControl, ExecRequest};
pub use lodge_core::domain::instance::{IdmapConfig, Instance, InstanceStatus};
pub use lodge_core::domain::operation::{OperationId, OperationStatus, OperationView};
pub use lodge_core::domain::response::{ApiResponse, ResponseType};
pub use lodge_core::presentation::api::{MigrationSinkRequest, MigrationSourceRequest};

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with an error envelope.
    #[error("{message} (code {code})")]
    Api { code: u16, message: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Operation {0} did not expose channel secrets")]
    MissingSecrets(OperationId),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl SdkError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SdkError::Api { code: 404, .. })
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;
