// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate root: one repository per
//! aggregate, interface defined in the domain layer, implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `InstanceRepository` | `Instance` | `InMemoryInstanceRepository`, `FileInstanceRepository` |
//!
//! Operations are deliberately not persisted: they live in the
//! `OperationRegistry` for the lifetime of the daemon only.

use crate::domain::instance::Instance;
use async_trait::async_trait;
use thiserror::Error;

/// Storage backend selection for repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    /// One JSON record per instance under the instances directory.
    File,
}

/// Repository interface for Instance aggregates
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Save instance (create or update)
    async fn save(&self, instance: &Instance) -> Result<(), RepositoryError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Instance>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Instance>, RepositoryError>;

    async fn delete(&self, name: &str) -> Result<(), RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}
