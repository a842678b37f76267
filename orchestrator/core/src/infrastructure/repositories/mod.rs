// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! the domain layer.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve domain aggregates
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryInstanceRepository** - HashMap-backed storage for tests and
//!   throwaway daemons
//! - **FileInstanceRepository** - one `instance.json` record inside each
//!   instance directory, so idmap reservations survive restarts

use crate::domain::instance::Instance;
use crate::domain::repository::{InstanceRepository, RepositoryError, StorageBackend};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const RECORD_FILE: &str = "instance.json";

#[derive(Clone, Default)]
pub struct InMemoryInstanceRepository {
    instances: Arc<RwLock<HashMap<String, Instance>>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn save(&self, instance: &Instance) -> Result<(), RepositoryError> {
        self.instances
            .write()
            .insert(instance.name.clone(), instance.clone());
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Instance>, RepositoryError> {
        Ok(self.instances.read().get(name).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Instance>, RepositoryError> {
        let mut all: Vec<Instance> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        self.instances
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(name.to_string()))
    }
}

/// Stores each instance as `<root>/<name>/instance.json`.
#[derive(Clone)]
pub struct FileInstanceRepository {
    root: PathBuf,
}

impl FileInstanceRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(RECORD_FILE)
    }

    async fn read_record(path: &Path) -> Result<Option<Instance>, RepositoryError> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl InstanceRepository for FileInstanceRepository {
    async fn save(&self, instance: &Instance) -> Result<(), RepositoryError> {
        let path = self.record_path(&instance.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(instance)?;
        // Rename over the old record so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Instance>, RepositoryError> {
        Self::read_record(&self.record_path(name)).await
    }

    async fn list_all(&self) -> Result<Vec<Instance>, RepositoryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut all = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(instance) = Self::read_record(&entry.path().join(RECORD_FILE)).await? {
                all.push(instance);
            }
        }
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete(&self, name: &str) -> Result<(), RepositoryError> {
        match tokio::fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepositoryError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the instance repository selected by configuration.
pub fn instance_repository(
    backend: &StorageBackend,
    instances_dir: &Path,
) -> Arc<dyn InstanceRepository> {
    match backend {
        StorageBackend::InMemory => Arc::new(InMemoryInstanceRepository::new()),
        StorageBackend::File => Arc::new(FileInstanceRepository::new(instances_dir)),
    }
}
