// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Instance Service
//!
//! Application service for the instance lifecycle: creation with idmap
//! allocation, start with pending remap, deletion, exec sessions and both
//! ends of a migration.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Coordinates the repository, the idmap allocator and the
//!   operation registry
//! - **Related:** `application::migration`, `infrastructure::shift`

use crate::application::exec::{ExecSession, EXEC_CHANNELS};
use crate::application::idmap_allocator::IdmapAllocator;
use crate::application::migration::{MigrationController, MigrationSink, MigrationSource};
use crate::application::operations::{Operation, OperationRegistry, OperationRequest, OperationTask};
use crate::domain::channel::RemoteOperation;
use crate::domain::events::InstanceEvent;
use crate::domain::exec::{ExecRequest, ExecRunner};
use crate::domain::idmap::{IdmapSet, POSIX_RANGE};
use crate::domain::instance::{IdmapConfig, Instance, InstanceError, InstanceStatus};
use crate::domain::operation::{OperationClass, OperationId};
use crate::domain::remap::{RemapError, RemapPlan, RemapReport};
use crate::domain::repository::{InstanceRepository, RepositoryError};
use crate::infrastructure::shift::shift_tree;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Body of instance creation and migration sink requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(default)]
    pub idmap: IdmapConfig,
}

impl CreateInstanceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idmap: IdmapConfig::default(),
        }
    }

    pub fn isolated(mut self) -> Self {
        self.idmap.isolated = true;
        self
    }
}

pub struct InstanceService {
    repo: Arc<dyn InstanceRepository>,
    allocator: Arc<IdmapAllocator>,
    registry: OperationRegistry,
    migration: Arc<MigrationController>,
    exec_runner: Arc<dyn ExecRunner>,
    instances_dir: PathBuf,
    /// Serializes read-modify-write cycles on instance records.
    records: Mutex<()>,
    /// Instances whose tree is being shifted outside the record lock.
    remapping: parking_lot::Mutex<HashSet<String>>,
}

/// Marks an instance as remapping until dropped.
struct RemapClaim<'a> {
    remapping: &'a parking_lot::Mutex<HashSet<String>>,
    name: String,
}

impl Drop for RemapClaim<'_> {
    fn drop(&mut self) {
        self.remapping.lock().remove(&self.name);
    }
}

struct RemapJob<'a> {
    claim: RemapClaim<'a>,
    plan: RemapPlan,
    root: PathBuf,
    target: IdmapSet,
}

impl InstanceService {
    pub fn new(
        repo: Arc<dyn InstanceRepository>,
        allocator: Arc<IdmapAllocator>,
        registry: OperationRegistry,
        migration: Arc<MigrationController>,
        exec_runner: Arc<dyn ExecRunner>,
        instances_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo,
            allocator,
            registry,
            migration,
            exec_runner,
            instances_dir: instances_dir.into(),
            records: Mutex::new(()),
            remapping: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Re-register isolated reservations of persisted instances.
    pub async fn restore_reservations(&self) -> Result<usize, InstanceError> {
        let mut restored = 0;
        for instance in self.repo.list_all().await? {
            let Some(base) = instance.volatile.base else {
                continue;
            };
            let size = instance.idmap.size.unwrap_or(POSIX_RANGE);
            match self.allocator.restore(base, size) {
                Ok(()) => restored += 1,
                Err(e) => warn!(instance = %instance.name, base, error = %e, "Failed to restore id reservation"),
            }
            if instance.status == InstanceStatus::Migrating {
                warn!(instance = %instance.name, "Instance was left mid-migration");
            }
        }
        Ok(restored)
    }

    pub async fn get(&self, name: &str) -> Result<Instance, InstanceError> {
        self.repo
            .find_by_name(name)
            .await?
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Instance>, InstanceError> {
        Ok(self.repo.list_all().await?)
    }

    pub async fn create(&self, request: CreateInstanceRequest) -> Result<Instance, InstanceError> {
        let _guard = self.records.lock().await;
        self.provision(request, InstanceStatus::Stopped, true).await
    }

    /// Allocate and persist a new record. `populated` marks the rootfs as
    /// already carrying the allocated map.
    async fn provision(
        &self,
        request: CreateInstanceRequest,
        status: InstanceStatus,
        populated: bool,
    ) -> Result<Instance, InstanceError> {
        Instance::validate_name(&request.name)?;
        if self.repo.find_by_name(&request.name).await?.is_some() {
            return Err(InstanceError::AlreadyExists(request.name));
        }

        let allocation = self.allocator.allocate(&request.idmap)?;
        let root = self.instances_dir.join(&request.name);
        let mut instance = Instance::new(&request.name, root, request.idmap);
        instance.status = status;
        instance.volatile.base = allocation.base;
        if populated {
            instance.volatile.last_state = allocation.set.clone();
        }
        instance.volatile.next = allocation.set;

        if let Err(e) = self.persist_new(&instance).await {
            if let Some(base) = allocation.base {
                self.allocator.release(base);
            }
            return Err(e);
        }

        info!(instance = %instance.name, isolated = instance.idmap.isolated, base = ?allocation.base, "Instance created");
        self.registry.events().publish_instance_event(InstanceEvent::Created {
            name: instance.name.clone(),
            isolated: instance.idmap.isolated,
            created_at: instance.created_at,
        });
        Ok(instance)
    }

    async fn persist_new(&self, instance: &Instance) -> Result<(), InstanceError> {
        tokio::fs::create_dir_all(instance.rootfs())
            .await
            .map_err(|e| InstanceError::Io(format!("{}: {}", instance.rootfs().display(), e)))?;
        self.repo.save(instance).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), InstanceError> {
        let _guard = self.records.lock().await;
        let instance = self.get(name).await?;
        self.ensure_not_remapping(&instance.name)?;
        match instance.status {
            InstanceStatus::Running => return Err(InstanceError::Running(instance.name)),
            InstanceStatus::Migrating => return Err(InstanceError::Migrating(instance.name)),
            InstanceStatus::Stopped => {}
        }
        self.remove(&instance).await
    }

    async fn remove(&self, instance: &Instance) -> Result<(), InstanceError> {
        match self.repo.delete(&instance.name).await {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(base) = instance.volatile.base {
            self.allocator.release(base);
        }
        match tokio::fs::remove_dir_all(&instance.root_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(instance = %instance.name, error = %e, "Failed to remove instance directory"),
        }

        info!(instance = %instance.name, "Instance deleted");
        self.registry.events().publish_instance_event(InstanceEvent::Deleted {
            name: instance.name.clone(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    /// Start an instance, remapping its tree first when the on-disk map
    /// differs from the one it must run with.
    pub async fn start(&self, name: &str) -> Result<Instance, InstanceError> {
        let job = {
            let _guard = self.records.lock().await;
            let instance = self.get(name).await?;
            self.allocator.check()?;
            self.ensure_not_remapping(&instance.name)?;
            if instance.status == InstanceStatus::Stopped && instance.remap_pending() {
                Some(self.begin_remap(&instance)?)
            } else {
                None
            }
        };
        if let Some(job) = job {
            self.run_remap(job).await?;
        }

        let _guard = self.records.lock().await;
        let mut instance = self.get(name).await?;
        self.ensure_not_remapping(&instance.name)?;
        instance.ensure_startable()?;

        instance.status = InstanceStatus::Running;
        instance.touch();
        self.repo.save(&instance).await?;

        info!(instance = %instance.name, "Instance started");
        self.registry.events().publish_instance_event(InstanceEvent::Started {
            name: instance.name.clone(),
            started_at: instance.updated_at,
        });
        Ok(instance)
    }

    pub async fn stop(&self, name: &str) -> Result<Instance, InstanceError> {
        let _guard = self.records.lock().await;
        let mut instance = self.get(name).await?;
        if instance.status != InstanceStatus::Running {
            return Err(InstanceError::NotRunning(instance.name));
        }
        instance.status = InstanceStatus::Stopped;
        instance.touch();
        self.repo.save(&instance).await?;
        info!(instance = %instance.name, "Instance stopped");
        Ok(instance)
    }

    fn ensure_not_remapping(&self, name: &str) -> Result<(), InstanceError> {
        if self.remapping.lock().contains(name) {
            return Err(InstanceError::Remapping(name.to_string()));
        }
        Ok(())
    }

    /// Plan a remap from `last_state` to `next` and claim the instance for
    /// it. Callers hold the record lock; the walk itself runs without it.
    fn begin_remap(&self, instance: &Instance) -> Result<RemapJob<'_>, InstanceError> {
        let plan = RemapPlan::build(&instance.volatile.last_state, &instance.volatile.next)?;
        if !self.remapping.lock().insert(instance.name.clone()) {
            return Err(InstanceError::Remapping(instance.name.clone()));
        }
        debug!(instance = %instance.name, from = %instance.volatile.last_state, to = %instance.volatile.next, "Remapping instance");
        Ok(RemapJob {
            claim: RemapClaim {
                remapping: &self.remapping,
                name: instance.name.clone(),
            },
            plan,
            root: instance.rootfs(),
            target: instance.volatile.next.clone(),
        })
    }

    /// Shift ownership and record the new on-disk map. The record lock is
    /// only taken to persist the result.
    async fn run_remap(&self, job: RemapJob<'_>) -> Result<RemapReport, InstanceError> {
        let RemapJob { claim, plan, root, target } = job;
        let report = tokio::task::spawn_blocking(move || shift_tree(&root, &plan))
            .await
            .map_err(|e| RemapError::Worker(e.to_string()))??;

        {
            let _guard = self.records.lock().await;
            let mut instance = self.get(&claim.name).await?;
            instance.mark_on_disk(target);
            self.repo.save(&instance).await?;
        }

        metrics::counter!("lodge_remap_files_changed_total").increment(report.changed);
        if !report.mismatches.is_empty() {
            warn!(
                instance = %claim.name,
                mismatches = report.mismatches.len(),
                "Idmap entries without a counterpart were left untouched"
            );
        }
        info!(instance = %claim.name, changed = report.changed, unchanged = report.unchanged, "Instance remapped");
        self.registry.events().publish_instance_event(InstanceEvent::Remapped {
            name: claim.name.clone(),
            report: report.clone(),
            remapped_at: Utc::now(),
        });
        Ok(report)
    }

    /// Run a command in a running instance over a websocket operation.
    pub async fn exec(&self, name: &str, request: ExecRequest) -> Result<Arc<Operation>, InstanceError> {
        request.validate()?;
        let instance = self.get(name).await?;
        if instance.status != InstanceStatus::Running {
            return Err(InstanceError::NotRunning(instance.name));
        }

        let url = instance.url();
        let session = ExecSession::new(
            instance,
            request,
            Arc::clone(&self.exec_runner),
            self.migration.settings().connect_timeout,
        );
        let request = OperationRequest::new(OperationClass::Websocket, "Executing command", OperationTask::Exec(session))
            .with_resource("instances", url)
            .with_channels(&EXEC_CHANNELS);
        Ok(self.registry.spawn(request)?)
    }

    /// Create the receiving instance and the websocket operation the source
    /// connects to.
    pub async fn create_migration_sink(
        self: &Arc<Self>,
        request: CreateInstanceRequest,
        live: bool,
    ) -> Result<(Instance, Arc<Operation>), InstanceError> {
        let instance = {
            let _guard = self.records.lock().await;
            self.provision(request, InstanceStatus::Migrating, false).await?
        };

        let sink = MigrationSink::new(
            Arc::clone(&self.migration),
            Arc::clone(self),
            instance.name.clone(),
            live,
        );
        let op_request = OperationRequest::new(OperationClass::Websocket, "Receiving instance", OperationTask::MigrationSink(sink))
            .with_resource("instances", instance.url())
            .with_channels(&MigrationController::sink_channels(live));

        match self.registry.spawn(op_request) {
            Ok(operation) => {
                info!(instance = %instance.name, operation_id = %operation.id(), live, "Migration sink ready");
                Ok((instance, operation))
            }
            Err(e) => {
                if let Err(cleanup) = self.abort_migration(&instance.name).await {
                    warn!(instance = %instance.name, error = %cleanup, "Failed to clean up migration sink");
                }
                Err(e.into())
            }
        }
    }

    /// Push an instance to a sink operation on another daemon.
    pub async fn start_migration_source(
        self: &Arc<Self>,
        name: &str,
        target: RemoteOperation,
        live: bool,
    ) -> Result<Arc<Operation>, InstanceError> {
        let instance = self.get(name).await?;
        self.ensure_not_remapping(&instance.name)?;
        match instance.status {
            InstanceStatus::Migrating => return Err(InstanceError::Migrating(instance.name)),
            InstanceStatus::Running if !live => return Err(InstanceError::Running(instance.name)),
            _ => {}
        }

        let url = instance.url();
        let source = MigrationSource::new(
            Arc::clone(&self.migration),
            Arc::clone(self),
            instance.name,
            target,
            live,
        );
        let request = OperationRequest::new(OperationClass::Task, "Migrating instance", OperationTask::MigrationSource(source))
            .with_resource("instances", url);
        Ok(self.registry.spawn(request)?)
    }

    /// Record a completed receive and remap the tree to this host's map.
    ///
    /// The instance leaves `Migrating` before the remap, so a failed remap
    /// leaves it stopped with the remap still pending.
    pub async fn finish_migration(
        &self,
        name: &str,
        operation_id: OperationId,
        on_disk: IdmapSet,
    ) -> Result<RemapReport, InstanceError> {
        let job = {
            let _guard = self.records.lock().await;
            let mut instance = self.get(name).await?;

            // A source without a map sent a tree that already matches ours.
            let on_disk = if on_disk.is_empty() {
                instance.volatile.next.clone()
            } else {
                on_disk
            };
            instance.mark_on_disk(on_disk);
            instance.status = InstanceStatus::Stopped;
            self.repo.save(&instance).await?;
            self.registry.events().publish_instance_event(InstanceEvent::MigrationReceived {
                name: instance.name.clone(),
                operation_id,
                received_at: Utc::now(),
            });

            if !instance.remap_pending() {
                return Ok(RemapReport::default());
            }
            self.begin_remap(&instance)?
        };
        self.run_remap(job).await
    }

    /// Drop a partially received instance and its reservation.
    pub async fn abort_migration(&self, name: &str) -> Result<(), InstanceError> {
        let _guard = self.records.lock().await;
        let instance = self.get(name).await?;
        self.remove(&instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::loopback::LoopbackDialer;
    use crate::application::migration::{MigrationSettings, TransportSet};
    use crate::domain::idmap::HostRange;
    use crate::domain::operation::OperationStatus;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::host_idmap::HostIdmapPool;
    use crate::infrastructure::process::HostExecRunner;
    use crate::infrastructure::repositories::InMemoryInstanceRepository;
    use crate::infrastructure::rsync::RsyncTransport;
    use std::time::Duration;

    const B: i64 = 1_000_000;

    fn service(dir: &std::path::Path, pool_size: i64) -> Arc<InstanceService> {
        let range = HostRange::new(B, pool_size);
        let registry = OperationRegistry::new(EventBus::new(64), Duration::from_secs(5));
        let transports = TransportSet::new(Arc::new(RsyncTransport::new("rsync", "lodge")));
        let controller = MigrationController::new(
            MigrationSettings::default(),
            transports,
            Arc::new(LoopbackDialer::new(registry.clone())),
        );
        Arc::new(InstanceService::new(
            Arc::new(InMemoryInstanceRepository::new()),
            Arc::new(IdmapAllocator::new(HostIdmapPool::Ready { uid: range, gid: range })),
            registry,
            Arc::new(controller),
            Arc::new(HostExecRunner::new()),
            dir,
        ))
    }

    #[tokio::test]
    async fn test_create_allocates_and_delete_releases() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 2 * POSIX_RANGE);

        let created = svc.create(CreateInstanceRequest::new("c1").isolated()).await.unwrap();
        assert_eq!(created.volatile.base, Some(B + POSIX_RANGE));
        assert!(!created.remap_pending());
        assert!(created.rootfs().is_dir());

        // The pool only holds one isolated range.
        assert!(matches!(
            svc.create(CreateInstanceRequest::new("c2").isolated()).await,
            Err(InstanceError::Idmap(_))
        ));
        assert!(svc.get("c2").await.is_err());

        svc.delete("c1").await.unwrap();
        assert!(!created.root_path.exists());
        svc.create(CreateInstanceRequest::new("c2").isolated()).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), POSIX_RANGE);
        svc.create(CreateInstanceRequest::new("web")).await.unwrap();
        assert!(matches!(
            svc.create(CreateInstanceRequest::new("web")).await,
            Err(InstanceError::AlreadyExists(_))
        ));
        assert!(matches!(
            svc.create(CreateInstanceRequest::new("../x")).await,
            Err(InstanceError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), POSIX_RANGE);
        svc.create(CreateInstanceRequest::new("c1")).await.unwrap();

        let started = svc.start("c1").await.unwrap();
        assert_eq!(started.status, InstanceStatus::Running);
        assert!(matches!(svc.start("c1").await, Err(InstanceError::AlreadyRunning(_))));
        assert!(matches!(svc.delete("c1").await, Err(InstanceError::Running(_))));

        assert_eq!(svc.stop("c1").await.unwrap().status, InstanceStatus::Stopped);
        assert!(matches!(svc.stop("c1").await, Err(InstanceError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_start_performs_pending_remap() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), POSIX_RANGE);
        let mut instance = svc.create(CreateInstanceRequest::new("c1")).await.unwrap();

        // Pretend the tree was written with another host's map.
        instance.volatile.last_state = IdmapSet::for_range(5_000_000, POSIX_RANGE);
        svc.repo.save(&instance).await.unwrap();
        assert!(svc.get("c1").await.unwrap().remap_pending());

        let started = svc.start("c1").await.unwrap();
        assert!(!started.remap_pending());
        assert_eq!(started.volatile.last_state, started.volatile.next);
    }

    #[tokio::test]
    async fn test_failed_remap_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), POSIX_RANGE);
        let mut instance = svc.create(CreateInstanceRequest::new("c1")).await.unwrap();
        instance.volatile.last_state = IdmapSet::for_range(5_000_000, 1000);
        svc.repo.save(&instance).await.unwrap();

        assert!(matches!(
            svc.start("c1").await,
            Err(InstanceError::Remap(RemapError::RangeMismatch { .. }))
        ));
        let stored = svc.get("c1").await.unwrap();
        assert_eq!(stored.status, InstanceStatus::Stopped);
        assert!(stored.remap_pending());
    }

    #[tokio::test]
    async fn test_remap_in_progress_does_not_block_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 3 * POSIX_RANGE);
        let mut instance = svc.create(CreateInstanceRequest::new("c1")).await.unwrap();
        instance.volatile.last_state = IdmapSet::for_range(5_000_000, POSIX_RANGE);
        svc.repo.save(&instance).await.unwrap();

        let job = {
            let _guard = svc.records.lock().await;
            svc.begin_remap(&svc.get("c1").await.unwrap()).unwrap()
        };

        // Allocation and unrelated records proceed while c1 is claimed.
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            svc.create(CreateInstanceRequest::new("c2").isolated()),
        )
        .await
        .expect("create waited behind a remap")
        .unwrap();
        assert_eq!(other.volatile.base, Some(B + POSIX_RANGE));
        svc.start("c2").await.unwrap();

        assert!(matches!(svc.start("c1").await, Err(InstanceError::Remapping(_))));
        assert!(matches!(svc.delete("c1").await, Err(InstanceError::Remapping(_))));

        svc.run_remap(job).await.unwrap();
        let started = svc.start("c1").await.unwrap();
        assert!(!started.remap_pending());
    }

    #[tokio::test]
    async fn test_concurrent_start_and_create_both_complete() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 3 * POSIX_RANGE);
        let mut instance = svc.create(CreateInstanceRequest::new("c1")).await.unwrap();
        for i in 0..500 {
            std::fs::write(instance.rootfs().join(format!("f{i}")), b"x").unwrap();
        }
        instance.volatile.last_state = IdmapSet::for_range(5_000_000, POSIX_RANGE);
        svc.repo.save(&instance).await.unwrap();

        let (started, created) = tokio::join!(
            svc.start("c1"),
            svc.create(CreateInstanceRequest::new("c2").isolated())
        );
        assert_eq!(started.unwrap().status, InstanceStatus::Running);
        assert_eq!(created.unwrap().volatile.base, Some(B + POSIX_RANGE));
        assert!(svc.remapping.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exec_requires_running_instance() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), POSIX_RANGE);
        svc.create(CreateInstanceRequest::new("c1")).await.unwrap();
        let request = ExecRequest {
            command: vec!["true".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            svc.exec("c1", request.clone()).await,
            Err(InstanceError::NotRunning(_))
        ));

        svc.start("c1").await.unwrap();
        let op = svc.exec("c1", request).await.unwrap();
        assert_eq!(op.class(), OperationClass::Websocket);
        assert_eq!(op.status(), OperationStatus::Running);
        assert_eq!(op.channels().unwrap().names().len(), 4);
        svc.registry().cancel(op.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_sink_removes_instance() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path(), 2 * POSIX_RANGE);
        let (instance, op) = svc
            .create_migration_sink(CreateInstanceRequest::new("incoming").isolated(), false)
            .await
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Migrating);
        assert!(matches!(svc.start("incoming").await, Err(InstanceError::Migrating(_))));

        let view = svc.registry().cancel(op.id()).await.unwrap();
        assert_eq!(view.status, OperationStatus::Cancelled);

        // The sink task notices the cancellation and cleans up.
        for _ in 0..50 {
            if svc.get("incoming").await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(svc.get("incoming").await, Err(InstanceError::NotFound(_))));
        svc.create(CreateInstanceRequest::new("next").isolated()).await.unwrap();
    }
}
