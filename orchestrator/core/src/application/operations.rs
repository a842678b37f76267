// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operation engine.
//!
//! An [`Operation`] tracks one piece of long-running daemon work. The
//! [`OperationRegistry`] owns every live operation, drives the state machine
//!
//! ```text
//! Pending -> Running -> {Success, Failure, Cancelled}
//! Running -> Cancelling -> {Cancelled, Failure}
//! Pending -> Cancelled
//! ```
//!
//! and removes terminal operations once the retention delay has passed.

use crate::application::channels::{ChannelClaim, ChannelTable};
use crate::application::exec::ExecSession;
use crate::application::migration::{MigrationSink, MigrationSource};
use crate::domain::channel::{ChannelConn, ChannelError};
use crate::domain::events::OperationEvent;
use crate::domain::operation::{
    OperationClass, OperationError, OperationId, OperationStatus, OperationView,
};
use crate::infrastructure::event_bus::EventBus;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Metadata key holding channel secrets of websocket operations.
pub const CHANNEL_SECRETS_KEY: &str = "fds";

const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(300);

pub type OperationFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type RunFn = Box<dyn FnOnce(OperationContext) -> OperationFuture + Send>;
pub type CancelFn = Box<dyn FnOnce(OperationContext) -> OperationFuture + Send>;

/// The work an operation owns.
pub enum OperationTask {
    /// Arbitrary work. Cancellable only with a cancel hook.
    Generic {
        run: RunFn,
        cancel: Option<CancelFn>,
    },
    /// Command with stdio over channels. Cancel closes the channels.
    Exec(ExecSession),
    /// Receiving end of a migration. Cancel closes the channels.
    MigrationSink(MigrationSink),
    /// Pushing end of a migration. Cancel closes its dialed channels.
    MigrationSource(MigrationSource),
    /// Never runs; lives until cancelled.
    Token,
}

impl OperationTask {
    pub fn generic<F, Fut>(run: F) -> Self
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        OperationTask::Generic {
            run: Box::new(move |ctx| run(ctx).boxed()),
            cancel: None,
        }
    }

    /// Attach a cancel hook to a generic task. Other variants are returned
    /// unchanged.
    pub fn with_cancel<F, Fut>(self, cancel: F) -> Self
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self {
            OperationTask::Generic { run, .. } => OperationTask::Generic {
                run,
                cancel: Some(Box::new(move |ctx| cancel(ctx).boxed())),
            },
            other => other,
        }
    }

    fn may_cancel(&self) -> bool {
        match self {
            OperationTask::Generic { cancel, .. } => cancel.is_some(),
            _ => true,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            OperationTask::Generic { .. } => "generic",
            OperationTask::Exec(_) => "exec",
            OperationTask::MigrationSink(_) => "migration_sink",
            OperationTask::MigrationSource(_) => "migration_source",
            OperationTask::Token => "token",
        }
    }

    fn into_parts(self) -> (Option<Runner>, CancelHook) {
        match self {
            OperationTask::Generic { run, cancel } => (
                Some(Runner::Generic(run)),
                cancel.map_or(CancelHook::None, CancelHook::Generic),
            ),
            OperationTask::Exec(session) => (Some(Runner::Exec(session)), CancelHook::CloseChannels),
            OperationTask::MigrationSink(sink) => {
                (Some(Runner::MigrationSink(sink)), CancelHook::CloseChannels)
            }
            OperationTask::MigrationSource(source) => {
                (Some(Runner::MigrationSource(source)), CancelHook::CloseChannels)
            }
            OperationTask::Token => (None, CancelHook::CloseChannels),
        }
    }
}

enum Runner {
    Generic(RunFn),
    Exec(ExecSession),
    MigrationSink(MigrationSink),
    MigrationSource(MigrationSource),
}

impl Runner {
    async fn run(self, ctx: OperationContext) -> anyhow::Result<()> {
        match self {
            Runner::Generic(run) => run(ctx).await,
            Runner::Exec(session) => session.run(ctx).await,
            Runner::MigrationSink(sink) => sink.run(ctx).await,
            Runner::MigrationSource(source) => source.run(ctx).await,
        }
    }
}

enum CancelHook {
    None,
    Generic(CancelFn),
    CloseChannels,
}

/// Everything needed to create an operation.
pub struct OperationRequest {
    pub class: OperationClass,
    pub description: String,
    pub resources: HashMap<String, Vec<String>>,
    pub metadata: Map<String, Value>,
    /// Channel names; websocket operations only.
    pub channels: Vec<String>,
    pub task: OperationTask,
}

impl OperationRequest {
    pub fn new(class: OperationClass, description: impl Into<String>, task: OperationTask) -> Self {
        Self {
            class,
            description: description.into(),
            resources: HashMap::new(),
            metadata: Map::new(),
            channels: Vec::new(),
            task,
        }
    }

    pub fn with_resource(mut self, kind: &str, url: impl Into<String>) -> Self {
        self.resources.entry(kind.to_string()).or_default().push(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_channels<S: AsRef<str>>(mut self, channels: &[S]) -> Self {
        self.channels = channels.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    fn validate(&self) -> Result<(), OperationError> {
        let is_token_task = matches!(self.task, OperationTask::Token);
        match self.class {
            OperationClass::Token if !is_token_task => Err(OperationError::InvalidDefinition(
                "token operations have no run task".to_string(),
            )),
            OperationClass::Task | OperationClass::Websocket if is_token_task => Err(
                OperationError::InvalidDefinition(format!("{} operations need a task", self.class)),
            ),
            OperationClass::Websocket if self.channels.is_empty() => Err(
                OperationError::InvalidDefinition("websocket operations need at least one channel".to_string()),
            ),
            OperationClass::Task | OperationClass::Token if !self.channels.is_empty() => Err(
                OperationError::InvalidDefinition(format!("{} operations have no channels", self.class)),
            ),
            _ => Ok(()),
        }
    }
}

struct OperationState {
    status: OperationStatus,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    resources: HashMap<String, Vec<String>>,
    metadata: Map<String, Value>,
    may_cancel: bool,
    err: String,
    task: Option<OperationTask>,
    cancel_hook: Option<CancelHook>,
}

pub struct Operation {
    id: OperationId,
    class: OperationClass,
    description: String,
    created_at: DateTime<Utc>,
    state: Mutex<OperationState>,
    channels: Option<Arc<ChannelTable>>,
    cancel: CancellationToken,
    finished: CancellationToken,
    events: EventBus,
}

impl Operation {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    pub fn status(&self) -> OperationStatus {
        self.state.lock().status
    }

    pub fn channels(&self) -> Option<&Arc<ChannelTable>> {
        self.channels.as_ref()
    }

    pub fn render(&self) -> OperationView {
        let state = self.state.lock();
        OperationView {
            id: self.id,
            class: self.class,
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: state.updated_at,
            status: state.status,
            status_code: state.status.code(),
            resources: state.resources.clone(),
            metadata: state.metadata.clone(),
            may_cancel: state.may_cancel,
            err: state.err.clone(),
        }
    }

    /// Replace the metadata. Fails once the operation is final.
    pub fn update_metadata(&self, metadata: Map<String, Value>) -> Result<(), OperationError> {
        let snapshot = {
            let mut state = self.state.lock();
            if state.status.is_final() {
                return Err(OperationError::Completed);
            }
            state.metadata = metadata;
            state.updated_at = Utc::now();
            state.metadata.clone()
        };
        self.publish_metadata(snapshot);
        Ok(())
    }

    /// Merge `metadata` into the existing metadata.
    pub fn extend_metadata(&self, metadata: Map<String, Value>) -> Result<(), OperationError> {
        let snapshot = {
            let mut state = self.state.lock();
            if state.status.is_final() {
                return Err(OperationError::Completed);
            }
            state.metadata.extend(metadata);
            state.updated_at = Utc::now();
            state.metadata.clone()
        };
        self.publish_metadata(snapshot);
        Ok(())
    }

    fn publish_metadata(&self, metadata: Map<String, Value>) {
        self.events.publish_operation_event(OperationEvent::MetadataUpdated {
            operation_id: self.id,
            metadata,
            updated_at: Utc::now(),
        });
    }

    /// Move to `to` if the state machine allows it. Returns whether it did.
    fn transition(&self, state: &mut OperationState, to: OperationStatus, err: Option<String>) -> bool {
        let from = state.status;
        if !from.can_transition_to(to) {
            debug!(operation_id = %self.id, %from, %to, "Ignoring status transition");
            return false;
        }

        let now = Utc::now();
        state.status = to;
        state.updated_at = now;
        if let Some(err) = err {
            state.err = err;
        }
        if to.is_final() {
            state.may_cancel = false;
            state.finished_at = Some(now);
            state.task = None;
            state.cancel_hook = None;
        }

        self.events.publish_operation_event(OperationEvent::StatusChanged {
            operation_id: self.id,
            class: self.class,
            from,
            to,
            changed_at: now,
        });
        if to.is_final() {
            metrics::counter!("lodge_operations_finished_total", "status" => to.to_string()).increment(1);
            self.finished.cancel();
        }
        true
    }

    fn context(self: &Arc<Self>) -> OperationContext {
        OperationContext {
            operation: Arc::clone(self),
        }
    }

    /// Outcome of the run task. Ignored once cancellation has begun.
    fn finish_run(&self, result: anyhow::Result<()>) {
        let mut state = self.state.lock();
        if state.status != OperationStatus::Running {
            debug!(operation_id = %self.id, status = %state.status, "Run finished after cancellation");
            return;
        }
        match result {
            Ok(()) => {
                self.transition(&mut state, OperationStatus::Success, None);
                info!(operation_id = %self.id, "Operation succeeded");
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(operation_id = %self.id, error = %message, "Operation failed");
                self.transition(&mut state, OperationStatus::Failure, Some(message));
            }
        }
    }

    /// Cancel the operation if it was never started.
    fn expire_pending(&self) {
        let mut state = self.state.lock();
        if state.status != OperationStatus::Pending {
            return;
        }
        self.transition(
            &mut state,
            OperationStatus::Cancelled,
            Some("operation was never started".to_string()),
        );
        self.cancel.cancel();
        info!(operation_id = %self.id, "Pending operation expired");
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<OperationView, OperationError> {
        let finished = self.finished.clone();
        match timeout {
            None => finished.cancelled().await,
            Some(limit) => tokio::time::timeout(limit, finished.cancelled())
                .await
                .map_err(|_| OperationError::Timeout(self.id))?,
        }
        Ok(self.render())
    }
}

/// Handle given to a running task.
#[derive(Clone)]
pub struct OperationContext {
    operation: Arc<Operation>,
}

impl OperationContext {
    pub fn id(&self) -> OperationId {
        self.operation.id
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    /// Fires when the operation is cancelled. Closes its channels too.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.operation.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.operation.cancel.is_cancelled()
    }

    pub fn channels(&self) -> Result<&Arc<ChannelTable>, OperationError> {
        self.operation.channels.as_ref().ok_or(OperationError::NotWebsocket)
    }

    /// Wait for the peer to open channel `name`.
    pub async fn accept(&self, name: &str, timeout: Duration) -> Result<ChannelConn, ChannelError> {
        match &self.operation.channels {
            Some(table) => table.accept(name, timeout).await,
            None => Err(ChannelError::Unknown(name.to_string())),
        }
    }

    pub fn extend_metadata(&self, metadata: Map<String, Value>) -> Result<(), OperationError> {
        self.operation.extend_metadata(metadata)
    }
}

struct RegistryInner {
    operations: RwLock<HashMap<OperationId, Arc<Operation>>>,
    events: EventBus,
    retention: Duration,
    pending_timeout: Duration,
    shutting_down: AtomicBool,
}

impl RegistryInner {
    fn remove(&self, id: OperationId) -> bool {
        let removed = self.operations.write().remove(&id).is_some();
        if removed {
            debug!(operation_id = %id, "Operation removed");
            self.events.publish_operation_event(OperationEvent::Removed {
                operation_id: id,
                removed_at: Utc::now(),
            });
        }
        removed
    }
}

/// Owns all operations of the daemon.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<RegistryInner>,
}

impl OperationRegistry {
    pub fn new(events: EventBus, retention: Duration) -> Self {
        Self::with_pending_timeout(events, retention, DEFAULT_PENDING_TIMEOUT)
    }

    /// Operations left Pending longer than `pending_timeout` are cancelled.
    pub fn with_pending_timeout(events: EventBus, retention: Duration, pending_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                operations: RwLock::new(HashMap::new()),
                events,
                retention,
                pending_timeout,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a Pending operation. The task does not run until `start`.
    pub fn create(&self, request: OperationRequest) -> Result<Arc<Operation>, OperationError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(OperationError::ShuttingDown);
        }
        request.validate()?;

        let id = OperationId::new();
        let cancel = CancellationToken::new();
        let mut metadata = request.metadata;
        let channels = match request.class {
            OperationClass::Websocket => {
                let table = ChannelTable::new(&request.channels, cancel.clone())?;
                metadata.insert(CHANNEL_SECRETS_KEY.to_string(), Value::Object(table.secrets()));
                Some(Arc::new(table))
            }
            _ => None,
        };

        let now = Utc::now();
        let kind = request.task.kind();
        let operation = Arc::new(Operation {
            id,
            class: request.class,
            description: request.description,
            created_at: now,
            state: Mutex::new(OperationState {
                status: OperationStatus::Pending,
                updated_at: now,
                finished_at: None,
                resources: request.resources,
                metadata,
                may_cancel: request.task.may_cancel(),
                err: String::new(),
                task: Some(request.task),
                cancel_hook: None,
            }),
            channels,
            cancel,
            finished: CancellationToken::new(),
            events: self.inner.events.clone(),
        });

        self.inner.operations.write().insert(id, Arc::clone(&operation));
        self.schedule_removal(&operation);

        metrics::counter!("lodge_operations_created_total", "class" => request.class.to_string()).increment(1);
        info!(operation_id = %id, class = %request.class, task = kind, "Operation created");
        self.inner.events.publish_operation_event(OperationEvent::Created {
            operation: operation.render(),
            created_at: now,
        });
        Ok(operation)
    }

    fn schedule_removal(&self, operation: &Arc<Operation>) {
        let inner: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let finished = operation.finished.clone();
        let id = operation.id;
        let retention = self.inner.retention;
        let pending_timeout = self.inner.pending_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = finished.cancelled() => {}
                _ = tokio::time::sleep(pending_timeout) => {
                    let operation = match inner.upgrade() {
                        Some(inner) => {
                            let found = inner.operations.read().get(&id).cloned();
                            found
                        }
                        None => None,
                    };
                    if let Some(operation) = operation {
                        operation.expire_pending();
                    }
                    finished.cancelled().await;
                }
            }
            tokio::time::sleep(retention).await;
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        });
    }

    pub fn get(&self, id: OperationId) -> Result<Arc<Operation>, OperationError> {
        self.inner
            .operations
            .read()
            .get(&id)
            .cloned()
            .ok_or(OperationError::NotFound(id))
    }

    pub fn list(&self) -> Vec<OperationView> {
        let operations: Vec<Arc<Operation>> = self.inner.operations.read().values().cloned().collect();
        let mut views: Vec<OperationView> = operations.iter().map(|op| op.render()).collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    /// Pending -> Running, then run the task on its own tokio task.
    pub fn start(&self, id: OperationId) -> Result<(), OperationError> {
        let operation = self.get(id)?;
        let runner = {
            let mut state = operation.state.lock();
            if state.status != OperationStatus::Pending {
                return Err(OperationError::NotPending);
            }
            let task = state.task.take().ok_or(OperationError::NotPending)?;
            let (runner, hook) = task.into_parts();
            state.cancel_hook = Some(hook);
            operation.transition(&mut state, OperationStatus::Running, None);
            runner
        };

        if let Some(runner) = runner {
            let ctx = operation.context();
            tokio::spawn(async move {
                let result = runner.run(ctx.clone()).await;
                ctx.operation.finish_run(result);
            });
        }
        Ok(())
    }

    /// Create and immediately start.
    pub fn spawn(&self, request: OperationRequest) -> Result<Arc<Operation>, OperationError> {
        let operation = self.create(request)?;
        self.start(operation.id)?;
        Ok(operation)
    }

    pub async fn cancel(&self, id: OperationId) -> Result<OperationView, OperationError> {
        let operation = self.get(id)?;
        let hook = {
            let mut state = operation.state.lock();
            if !state.may_cancel {
                return Err(OperationError::NotCancellable(state.status));
            }
            match state.status {
                OperationStatus::Pending => {
                    operation.transition(&mut state, OperationStatus::Cancelled, None);
                    operation.cancel.cancel();
                    info!(operation_id = %id, "Pending operation cancelled");
                    return Ok(Self::render_locked(&operation, &state));
                }
                OperationStatus::Running => {
                    let hook = state.cancel_hook.take().unwrap_or(CancelHook::None);
                    operation.transition(&mut state, OperationStatus::Cancelling, None);
                    hook
                }
                other => return Err(OperationError::NotCancellable(other)),
            }
        };

        let outcome = match hook {
            CancelHook::None => Ok(()),
            CancelHook::CloseChannels => {
                operation.cancel.cancel();
                Ok(())
            }
            CancelHook::Generic(cancel) => cancel(operation.context()).await,
        };

        {
            let mut state = operation.state.lock();
            match outcome {
                Ok(()) => {
                    operation.cancel.cancel();
                    operation.transition(&mut state, OperationStatus::Cancelled, None);
                    info!(operation_id = %id, "Operation cancelled");
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(operation_id = %id, error = %message, "Cancel hook failed");
                    operation.transition(&mut state, OperationStatus::Failure, Some(message));
                }
            }
        }
        Ok(operation.render())
    }

    fn render_locked(operation: &Operation, state: &OperationState) -> OperationView {
        OperationView {
            id: operation.id,
            class: operation.class,
            description: operation.description.clone(),
            created_at: operation.created_at,
            updated_at: state.updated_at,
            status: state.status,
            status_code: state.status.code(),
            resources: state.resources.clone(),
            metadata: state.metadata.clone(),
            may_cancel: state.may_cancel,
            err: state.err.clone(),
        }
    }

    /// Wait for completion; `None` waits forever.
    pub async fn wait(&self, id: OperationId, timeout: Option<Duration>) -> Result<OperationView, OperationError> {
        let operation = self.get(id)?;
        operation.wait(timeout).await
    }

    /// Claim a channel of a running websocket operation by secret.
    pub fn claim(&self, id: OperationId, secret: &str) -> Result<ChannelClaim, OperationError> {
        let operation = self.get(id)?;
        let table = operation.channels.as_ref().ok_or(OperationError::NotWebsocket)?;
        if operation.status() != OperationStatus::Running {
            return Err(OperationError::NotRunning);
        }
        Ok(table.claim(secret)?)
    }

    /// Attach `conn` to the channel whose secret is `secret`.
    pub fn connect(&self, id: OperationId, secret: &str, conn: ChannelConn) -> Result<String, OperationError> {
        let claim = self.claim(id, secret)?;
        let name = claim.name().to_string();
        claim.deliver(conn)?;
        debug!(operation_id = %id, channel = %name, "Channel attached");
        Ok(name)
    }

    /// Drop terminal operations older than the retention delay.
    pub fn remove_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inner.retention).unwrap_or_else(|_| chrono::Duration::zero());
        let expired: Vec<OperationId> = self
            .inner
            .operations
            .read()
            .values()
            .filter(|op| {
                op.state
                    .lock()
                    .finished_at
                    .is_some_and(|at| at <= cutoff)
            })
            .map(|op| op.id)
            .collect();
        expired.into_iter().filter(|id| self.inner.remove(*id)).count()
    }

    /// Cancel everything cancellable and refuse new operations.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let pending: Vec<OperationId> = self
            .inner
            .operations
            .read()
            .values()
            .filter(|op| {
                let state = op.state.lock();
                state.may_cancel && !state.status.is_final()
            })
            .map(|op| op.id)
            .collect();

        info!(count = pending.len(), "Cancelling outstanding operations");
        for id in pending {
            if let Err(e) = self.cancel(id).await {
                debug!(operation_id = %id, error = %e, "Operation not cancelled during shutdown");
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> OperationRegistry {
        OperationRegistry::new(EventBus::with_default_capacity(), Duration::from_secs(60))
    }

    fn task(class: OperationClass, task: OperationTask) -> OperationRequest {
        OperationRequest::new(class, "test", task)
    }

    #[tokio::test]
    async fn test_run_to_success() {
        let registry = registry();
        let op = registry
            .spawn(task(OperationClass::Task, OperationTask::generic(|_| async { Ok(()) })))
            .unwrap();
        let view = registry.wait(op.id(), Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(view.status, OperationStatus::Success);
        assert_eq!(view.status_code, 200);
        assert!(!view.may_cancel);
    }

    #[tokio::test]
    async fn test_failure_keeps_message() {
        let registry = registry();
        let op = registry
            .spawn(task(
                OperationClass::Task,
                OperationTask::generic(|_| async { Err(anyhow::anyhow!("disk full")) }),
            ))
            .unwrap();
        let view = registry.wait(op.id(), None).await.unwrap();
        assert_eq!(view.status, OperationStatus::Failure);
        assert_eq!(view.err, "disk full");
        assert!(op.extend_metadata(Map::new()).is_err());
    }

    #[tokio::test]
    async fn test_invalid_definitions() {
        let registry = registry();
        assert!(registry
            .create(task(OperationClass::Token, OperationTask::generic(|_| async { Ok(()) })))
            .is_err());
        assert!(registry
            .create(task(OperationClass::Websocket, OperationTask::generic(|_| async { Ok(()) })))
            .is_err());
        assert!(registry
            .create(task(OperationClass::Task, OperationTask::Token))
            .is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let registry = registry();
        let op = registry
            .spawn(task(OperationClass::Task, OperationTask::generic(|_| async { Ok(()) })))
            .unwrap();
        assert!(matches!(registry.start(op.id()), Err(OperationError::NotPending)));
    }

    #[tokio::test]
    async fn test_cancel_without_hook_is_refused() {
        let registry = registry();
        let op = registry
            .spawn(task(
                OperationClass::Task,
                OperationTask::generic(|_| futures::future::pending()),
            ))
            .unwrap();
        assert!(matches!(
            registry.cancel(op.id()).await,
            Err(OperationError::NotCancellable(OperationStatus::Running))
        ));
    }

    #[tokio::test]
    async fn test_late_run_result_does_not_overwrite_cancel() {
        let registry = registry();
        let release = CancellationToken::new();
        let gate = release.clone();
        let op = registry
            .spawn(task(
                OperationClass::Task,
                OperationTask::generic(move |_| async move {
                    gate.cancelled().await;
                    Ok(())
                })
                .with_cancel(|_| async { Ok(()) }),
            ))
            .unwrap();

        let view = registry.cancel(op.id()).await.unwrap();
        assert_eq!(view.status, OperationStatus::Cancelled);

        release.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(op.status(), OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failing_cancel_hook_is_failure() {
        let registry = registry();
        let op = registry
            .spawn(task(
                OperationClass::Task,
                OperationTask::generic(|_| futures::future::pending())
                    .with_cancel(|_| async { Err(anyhow::anyhow!("still busy")) }),
            ))
            .unwrap();
        let view = registry.cancel(op.id()).await.unwrap();
        assert_eq!(view.status, OperationStatus::Failure);
        assert_eq!(view.err, "still busy");
    }

    #[tokio::test]
    async fn test_token_lives_until_cancelled() {
        let registry = registry();
        let op = registry
            .spawn(task(OperationClass::Token, OperationTask::Token))
            .unwrap();
        assert_eq!(op.status(), OperationStatus::Running);
        assert!(registry.wait(op.id(), Some(Duration::from_millis(20))).await.is_err());

        registry.cancel(op.id()).await.unwrap();
        assert_eq!(op.status(), OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_websocket_metadata_carries_secrets() {
        let registry = registry();
        let op = registry
            .create(
                task(
                    OperationClass::Websocket,
                    OperationTask::generic(|_| async { Ok(()) }),
                )
                .with_channels(&["control", "fs"]),
            )
            .unwrap();
        let view = op.render();
        let secrets = view.metadata[CHANNEL_SECRETS_KEY].as_object().unwrap();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets["fs"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_connect_requires_running_websocket() {
        let registry = registry();
        let op = registry
            .create(
                task(
                    OperationClass::Websocket,
                    OperationTask::generic(|_| async { Ok(()) }),
                )
                .with_channels(&["control"]),
            )
            .unwrap();
        let secret = op.render().metadata[CHANNEL_SECRETS_KEY]["control"]
            .as_str()
            .unwrap()
            .to_string();
        let (conn, _peer) = ChannelConn::pair("control", 1);
        assert!(matches!(
            registry.connect(op.id(), &secret, conn),
            Err(OperationError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_remove_expired() {
        let registry = OperationRegistry::new(EventBus::with_default_capacity(), Duration::ZERO);
        let op = registry
            .spawn(task(OperationClass::Task, OperationTask::generic(|_| async { Ok(()) })))
            .unwrap();
        registry.wait(op.id(), None).await.unwrap();
        registry.remove_expired();
        assert!(matches!(registry.get(op.id()), Err(OperationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unstarted_operation_expires() {
        let registry = OperationRegistry::with_pending_timeout(
            EventBus::with_default_capacity(),
            Duration::from_millis(300),
            Duration::from_millis(100),
        );
        let op = registry
            .create(task(OperationClass::Task, OperationTask::generic(|_| async { Ok(()) })))
            .unwrap();
        assert_eq!(op.status(), OperationStatus::Pending);

        let view = registry.wait(op.id(), Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(view.status, OperationStatus::Cancelled);
        assert_eq!(view.err, "operation was never started");
        assert!(matches!(registry.start(op.id()), Err(OperationError::NotPending)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(op.id()).is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_started_operation_does_not_expire() {
        let registry = OperationRegistry::with_pending_timeout(
            EventBus::with_default_capacity(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let release = CancellationToken::new();
        let gate = release.clone();
        let op = registry
            .spawn(task(
                OperationClass::Task,
                OperationTask::generic(move |_| async move {
                    gate.cancelled().await;
                    Ok(())
                }),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(op.status(), OperationStatus::Running);
        release.cancel();
        let view = registry.wait(op.id(), Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(view.status, OperationStatus::Success);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_refuses() {
        let registry = registry();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let op = registry
            .create(task(
                OperationClass::Task,
                OperationTask::generic(move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .with_cancel(|_| async { Ok(()) }),
            ))
            .unwrap();

        registry.shutdown().await;
        assert_eq!(op.status(), OperationStatus::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(matches!(
            registry.create(task(OperationClass::Token, OperationTask::Token)),
            Err(OperationError::ShuttingDown)
        ));
    }
}
