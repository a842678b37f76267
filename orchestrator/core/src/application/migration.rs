// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Migration controller.
//!
//! The target runs a websocket operation with channels "control", "fs" and,
//! for live transfers, "criu". The source dials them, sends its offer,
//! checks the answer, streams the tree and ends with a control message.
//!
//! Ordering on the wire:
//! 1. offer and answer on "control"
//! 2. filesystem on "fs"
//! 3. checkpoint on "criu" (live only)
//! 4. final `MigrationControl` on "control"
//!
//! The target treats only that final message as success. EOF or silence
//! fails the operation. A failure message aborts the target at any point,
//! including mid-transfer.

use crate::application::instance_service::InstanceService;
use crate::application::operations::OperationContext;
use crate::domain::channel::{
    ChannelConn, ChannelDialer, ChannelError, RemoteOperation, CONTROL_CHANNEL, CRIU_CHANNEL, FS_CHANNEL,
};
use crate::domain::idmap::IdmapSet;
use crate::domain::migration::{
    ControlMessage, CriuType, FsTransport, MigrationError, MigrationFsType, MigrationOffer,
    RsyncFeatureSet, SinkCapabilities,
};
use crate::domain::node_config::MigrationConfig;
use crate::infrastructure::migration_proto::{
    decode_control, recv_control, recv_offer, send_control, send_offer,
};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationSettings {
    /// How long a peer gets to open each channel.
    pub connect_timeout: Duration,
    /// How long "control" may stay silent when a message is due.
    pub idle_timeout: Duration,
}

impl From<&MigrationConfig> for MigrationSettings {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Filesystem transports known to this host: rsync always, plus an optional
/// storage-driver transport offered first.
#[derive(Clone)]
pub struct TransportSet {
    preferred: Option<Arc<dyn FsTransport>>,
    rsync: Arc<dyn FsTransport>,
}

impl TransportSet {
    pub fn new(rsync: Arc<dyn FsTransport>) -> Self {
        Self {
            preferred: None,
            rsync,
        }
    }

    pub fn with_preferred(mut self, transport: Arc<dyn FsTransport>) -> Self {
        self.preferred = Some(transport);
        self
    }

    /// Transport type this host offers or answers with.
    pub fn offered_type(&self) -> MigrationFsType {
        self.preferred
            .as_ref()
            .map(|t| t.fs_type())
            .unwrap_or(MigrationFsType::Rsync)
    }

    pub fn select(&self, fs_type: MigrationFsType) -> Result<Arc<dyn FsTransport>, MigrationError> {
        match &self.preferred {
            Some(t) if t.fs_type() == fs_type => Ok(Arc::clone(t)),
            _ if fs_type == MigrationFsType::Rsync => Ok(Arc::clone(&self.rsync)),
            _ => Err(MigrationError::UnsupportedTransport(fs_type.to_string())),
        }
    }
}

pub struct MigrationController {
    settings: MigrationSettings,
    transports: TransportSet,
    dialer: Arc<dyn ChannelDialer>,
}

impl MigrationController {
    pub fn new(settings: MigrationSettings, transports: TransportSet, dialer: Arc<dyn ChannelDialer>) -> Self {
        Self {
            settings,
            transports,
            dialer,
        }
    }

    pub fn settings(&self) -> MigrationSettings {
        self.settings
    }

    /// Channels the target operation declares.
    pub fn sink_channels(live: bool) -> Vec<&'static str> {
        let mut channels = vec![CONTROL_CHANNEL, FS_CHANNEL];
        if live {
            channels.push(CRIU_CHANNEL);
        }
        channels
    }

    fn capabilities(&self, live: bool) -> SinkCapabilities {
        SinkCapabilities {
            fs_type: self.transports.offered_type(),
            rsync_features: RsyncFeatureSet::all(),
            live,
        }
    }

    fn offer(&self, on_disk: &IdmapSet, live: bool) -> MigrationOffer {
        MigrationOffer {
            fs_type: self.transports.offered_type(),
            criu: live.then_some(CriuType::CriuRsync),
            idmap: on_disk.entries().to_vec(),
            snapshot_names: Vec::new(),
            rsync_features: RsyncFeatureSet::all(),
            predump: false,
            refresh: false,
        }
    }
}

/// Tracks "control" while a tree is being received.
struct ControlWatch {
    final_message: Option<ControlMessage>,
    open: bool,
}

impl ControlWatch {
    fn new() -> Self {
        Self {
            final_message: None,
            open: true,
        }
    }

    fn accept_frame(&mut self, frame: &[u8]) -> Result<(), MigrationError> {
        let msg = decode_control(frame)?;
        if !msg.success {
            return Err(MigrationError::Aborted(msg.message));
        }
        self.final_message = Some(msg);
        Ok(())
    }

    /// The source's final message, waiting at most `idle` for it.
    async fn finish(mut self, control: &mut ChannelConn, idle: Duration) -> Result<(), MigrationError> {
        if self.final_message.is_some() {
            return Ok(());
        }
        if !self.open {
            return Err(MigrationError::ControlClosed);
        }
        let msg = recv_control(control, idle).await?;
        if !msg.success {
            return Err(MigrationError::Aborted(msg.message));
        }
        self.final_message = Some(msg);
        Ok(())
    }
}

/// Receive one tree while listening for an early abort on "control".
async fn receive_watching(
    transport: &dyn FsTransport,
    path: &Path,
    conn: &mut ChannelConn,
    features: &RsyncFeatureSet,
    control: &mut ChannelConn,
    watch: &mut ControlWatch,
) -> Result<(), MigrationError> {
    let recv = transport.recv(path, conn, features);
    tokio::pin!(recv);
    loop {
        tokio::select! {
            res = &mut recv => return res,
            frame = control.recv(), if watch.open && watch.final_message.is_none() => match frame? {
                Some(frame) => watch.accept_frame(&frame)?,
                None => watch.open = false,
            },
        }
    }
}

/// Receiving end. Runs as the task of the target's websocket operation.
pub struct MigrationSink {
    controller: Arc<MigrationController>,
    instances: Arc<InstanceService>,
    name: String,
    live: bool,
}

impl MigrationSink {
    pub fn new(controller: Arc<MigrationController>, instances: Arc<InstanceService>, name: String, live: bool) -> Self {
        Self {
            controller,
            instances,
            name,
            live,
        }
    }

    pub async fn run(self, ctx: OperationContext) -> anyhow::Result<()> {
        let on_disk = match self.receive(&ctx).await {
            Ok(on_disk) => on_disk,
            Err(e) => {
                warn!(operation_id = %ctx.id(), instance = %self.name, error = %e, "Migration receive failed");
                if let Err(cleanup) = self.instances.abort_migration(&self.name).await {
                    warn!(instance = %self.name, error = %cleanup, "Failed to clean up aborted migration");
                }
                return Err(e.into());
            }
        };

        // The transfer is done; the remap decides the outcome.
        let report = self
            .instances
            .finish_migration(&self.name, ctx.id(), on_disk)
            .await
            .with_context(|| format!("failed to remap instance {}", self.name))?;
        info!(
            operation_id = %ctx.id(),
            instance = %self.name,
            changed = report.changed,
            "Migration received"
        );
        Ok(())
    }

    /// Returns the idmap the received tree was written with.
    async fn receive(&self, ctx: &OperationContext) -> Result<IdmapSet, MigrationError> {
        let settings = self.controller.settings;
        let instance = self.instances.get(&self.name).await?;

        let mut control = ctx.accept(CONTROL_CHANNEL, settings.connect_timeout).await?;
        match self.receive_over(ctx, &instance.rootfs(), &instance.state_dir(), &mut control).await {
            Ok(on_disk) => Ok(on_disk),
            // The source already knows, or can no longer be told.
            Err(e @ (MigrationError::Aborted(_) | MigrationError::ControlClosed | MigrationError::Cancelled)) => {
                Err(e)
            }
            Err(e) => Err(report(&mut control, e).await),
        }
    }

    async fn receive_over(
        &self,
        ctx: &OperationContext,
        rootfs: &Path,
        state_dir: &Path,
        control: &mut ChannelConn,
    ) -> Result<IdmapSet, MigrationError> {
        let settings = self.controller.settings;
        let offer = recv_offer(control, settings.idle_timeout).await?;
        let answer = offer.answer(&self.controller.capabilities(self.live));
        let transport = self.controller.transports.select(answer.fs_type)?;
        send_offer(control, &answer).await?;
        debug!(
            operation_id = %ctx.id(),
            fs = %answer.fs_type,
            live = answer.is_live(),
            "Migration answer sent"
        );

        let mut watch = ControlWatch::new();

        let mut fs = ctx.accept(FS_CHANNEL, settings.connect_timeout).await?;
        receive_watching(
            transport.as_ref(),
            rootfs,
            &mut fs,
            &answer.rsync_features,
            control,
            &mut watch,
        )
        .await?;
        drop(fs);

        if answer.is_live() {
            let mut criu = ctx.accept(CRIU_CHANNEL, settings.connect_timeout).await?;
            receive_watching(
                transport.as_ref(),
                state_dir,
                &mut criu,
                &answer.rsync_features,
                control,
                &mut watch,
            )
            .await?;
        }

        watch.finish(control, settings.idle_timeout).await?;
        if let Ok(channels) = ctx.channels() {
            channels.close_all();
        }
        Ok(IdmapSet::from_entries(offer.idmap))
    }
}

/// Pushing end. Runs as a task operation on the source daemon.
pub struct MigrationSource {
    controller: Arc<MigrationController>,
    instances: Arc<InstanceService>,
    name: String,
    target: RemoteOperation,
    live: bool,
}

async fn report(control: &mut ChannelConn, error: MigrationError) -> MigrationError {
    if let Err(e) = send_control(control, &ControlMessage::failure(error.to_string())).await {
        debug!(error = %e, "Could not report migration failure to target");
    }
    error
}

impl MigrationSource {
    pub fn new(
        controller: Arc<MigrationController>,
        instances: Arc<InstanceService>,
        name: String,
        target: RemoteOperation,
        live: bool,
    ) -> Self {
        Self {
            controller,
            instances,
            name,
            target,
            live,
        }
    }

    /// Dial one target channel, bounded by the connect timeout and the
    /// operation's cancellation.
    async fn dial(&self, ctx: &OperationContext, channel: &str) -> Result<ChannelConn, MigrationError> {
        let limit = self.controller.settings.connect_timeout;
        let dial = tokio::time::timeout(limit, self.controller.dialer.dial(&self.target, channel));
        let conn = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return Err(MigrationError::Cancelled),
            dialed = dial => dialed.map_err(|_| ChannelError::ConnectTimeout(channel.to_string()))??,
        };
        Ok(conn.with_cancel(ctx.cancel_token().clone()))
    }

    pub async fn run(self, ctx: OperationContext) -> anyhow::Result<()> {
        self.push(&ctx)
            .await
            .with_context(|| format!("failed to migrate instance {}", self.name))?;
        info!(operation_id = %ctx.id(), instance = %self.name, "Migration sent");
        Ok(())
    }

    async fn push(&self, ctx: &OperationContext) -> Result<(), MigrationError> {
        let settings = self.controller.settings;
        let instance = self.instances.get(&self.name).await?;
        let on_disk = if instance.volatile.last_state.is_empty() {
            &instance.volatile.next
        } else {
            &instance.volatile.last_state
        };

        let mut control = self.dial(ctx, CONTROL_CHANNEL).await?;
        let offer = self.controller.offer(on_disk, self.live);

        let negotiated = async {
            send_offer(&mut control, &offer).await?;
            let answer = recv_offer(&mut control, settings.idle_timeout).await?;
            offer.check_answer(&answer)?;
            let transport = self.controller.transports.select(answer.fs_type)?;
            Ok::<_, MigrationError>((answer, transport))
        }
        .await;
        let (answer, transport) = match negotiated {
            Ok(agreed) => agreed,
            Err(e) => return Err(report(&mut control, e).await),
        };
        debug!(
            operation_id = %ctx.id(),
            fs = %answer.fs_type,
            live = answer.is_live(),
            "Migration negotiated"
        );

        let mut fs = match self.dial(ctx, FS_CHANNEL).await {
            Ok(fs) => fs,
            Err(e) => return Err(report(&mut control, e).await),
        };
        if let Err(e) = transport
            .send(&instance.rootfs(), &mut fs, &answer.rsync_features)
            .await
        {
            // Report before "fs" goes away.
            let e = report(&mut control, e).await;
            drop(fs);
            return Err(e);
        }
        drop(fs);

        if answer.is_live() {
            let mut criu = match self.dial(ctx, CRIU_CHANNEL).await {
                Ok(criu) => criu,
                Err(e) => return Err(report(&mut control, e).await),
            };
            if let Err(e) = transport
                .send(&instance.state_dir(), &mut criu, &answer.rsync_features)
                .await
            {
                let e = report(&mut control, e).await;
                drop(criu);
                return Err(e);
            }
        }

        send_control(&mut control, &ControlMessage::success()).await?;
        if let Err(e) = control.close().await {
            debug!(error = %e, "Control channel already closed");
        }
        Ok(())
    }
}
