// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! REST response envelope shared by the daemon and its clients.

use crate::domain::operation::OperationView;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Sync,
    Async,
    Error,
}

/// `{type, status, status_code, operation, error, error_code, metadata}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    /// URL of the background operation for async responses.
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub metadata: Value,
}

impl ApiResponse {
    pub fn sync(metadata: Value) -> Self {
        Self {
            kind: ResponseType::Sync,
            status: "Success".to_string(),
            status_code: 200,
            operation: String::new(),
            error: String::new(),
            error_code: 0,
            metadata,
        }
    }

    pub fn operation(view: &OperationView) -> Self {
        Self {
            kind: ResponseType::Async,
            status: "Operation created".to_string(),
            status_code: 100,
            operation: view.id.url(),
            error: String::new(),
            error_code: 0,
            metadata: serde_json::to_value(view).unwrap_or(Value::Null),
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ResponseType::Error,
            status: String::new(),
            status_code: 0,
            operation: String::new(),
            error: message.into(),
            error_code: code,
            metadata: Value::Null,
        }
    }

    /// Decode the metadata payload.
    pub fn metadata_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.metadata)
    }
}
