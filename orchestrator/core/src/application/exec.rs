// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Exec sessions.
//!
//! The command starts once all four channels are attached. Completion waits
//! for the process to exit and for both output pumps to drain; the stdin and
//! control pumps are aborted at exit.

use crate::application::operations::OperationContext;
use crate::domain::channel::{
    ChannelConn, ChannelError, CONTROL_CHANNEL, STDERR_CHANNEL, STDIN_CHANNEL, STDOUT_CHANNEL,
};
use crate::domain::exec::{ExecControl, ExecOutput, ExecRequest, ExecRunner, ExecSignaller};
use crate::domain::instance::Instance;
use crate::infrastructure::channel_io::{copy_reader_to_sink, copy_stream_to_writer};
use anyhow::{anyhow, Context};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EXEC_CHANNELS: [&str; 4] = [STDIN_CHANNEL, STDOUT_CHANNEL, STDERR_CHANNEL, CONTROL_CHANNEL];

pub struct ExecSession {
    instance: Instance,
    request: ExecRequest,
    runner: Arc<dyn ExecRunner>,
    connect_timeout: Duration,
}

fn pump_output(mut conn: ChannelConn, reader: ExecOutput) -> JoinHandle<Result<u64, ChannelError>> {
    tokio::spawn(async move {
        let name = conn.name().to_string();
        let (sink, _, cancel) = conn.parts_mut();
        let cancel = cancel.clone();
        copy_reader_to_sink(reader, sink, &cancel, &name).await
    })
}

fn pump_control(mut conn: ChannelConn, signaller: Arc<dyn ExecSignaller>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(Some(frame)) = conn.recv().await {
            match serde_json::from_slice::<ExecControl>(&frame) {
                Ok(msg) if msg.command == "signal" => {
                    if let Err(e) = signaller.signal(msg.signal) {
                        warn!(signal = msg.signal, error = %e, "Failed to forward signal");
                    }
                }
                Ok(msg) => debug!(command = %msg.command, "Ignoring exec control command"),
                Err(e) => warn!(error = %e, "Malformed exec control message"),
            }
        }
    })
}

impl ExecSession {
    pub fn new(
        instance: Instance,
        request: ExecRequest,
        runner: Arc<dyn ExecRunner>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            instance,
            request,
            runner,
            connect_timeout,
        }
    }

    pub async fn run(self, ctx: OperationContext) -> anyhow::Result<()> {
        let timeout = self.connect_timeout;
        let (mut stdin, stdout, stderr, control) = tokio::try_join!(
            ctx.accept(STDIN_CHANNEL, timeout),
            ctx.accept(STDOUT_CHANNEL, timeout),
            ctx.accept(STDERR_CHANNEL, timeout),
            ctx.accept(CONTROL_CHANNEL, timeout),
        )
        .context("exec channels were not attached")?;

        let mut spawned = self
            .runner
            .spawn(&self.instance, &self.request)
            .await
            .with_context(|| format!("failed to run command in instance {}", self.instance.name))?;
        info!(operation_id = %ctx.id(), instance = %self.instance.name, "Exec started");

        let writer = spawned.stdio.stdin;
        let stdin_pump = tokio::spawn(async move {
            let name = stdin.name().to_string();
            let (_, stream, cancel) = stdin.parts_mut();
            let cancel = cancel.clone();
            copy_stream_to_writer(stream, writer, &cancel, &name).await
        });
        let stdout_pump = pump_output(stdout, spawned.stdio.stdout);
        let stderr_pump = pump_output(stderr, spawned.stdio.stderr);
        let control_pump = pump_control(control, Arc::clone(&spawned.signaller));

        let cancel = ctx.cancel_token().clone();
        let exited = tokio::select! {
            code = spawned.process.wait() => Some(code),
            _ = cancel.cancelled() => None,
        };

        stdin_pump.abort();
        control_pump.abort();

        let code = match exited {
            Some(code) => code?,
            None => {
                if let Err(e) = spawned.signaller.signal(libc::SIGKILL) {
                    debug!(error = %e, "Process already gone");
                }
                match spawned.process.wait().await {
                    Ok(code) => debug!(operation_id = %ctx.id(), code, "Killed command reaped"),
                    Err(e) => warn!(operation_id = %ctx.id(), error = %e, "Failed to reap killed command"),
                }
                stdout_pump.abort();
                stderr_pump.abort();
                return Err(anyhow!("exec cancelled"));
            }
        };

        for (name, pump) in [("stdout", stdout_pump), ("stderr", stderr_pump)] {
            match pump.await {
                Ok(Ok(bytes)) => debug!(stream = name, bytes, "Output drained"),
                Ok(Err(e)) => debug!(stream = name, error = %e, "Output pump stopped early"),
                Err(e) => warn!(stream = name, error = %e, "Output pump panicked"),
            }
        }

        let mut metadata = Map::new();
        metadata.insert("return".to_string(), json!(code));
        ctx.extend_metadata(metadata)?;
        info!(operation_id = %ctx.id(), instance = %self.instance.name, code, "Exec finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::operations::{OperationRegistry, OperationRequest, OperationTask};
    use crate::domain::exec::{ExecError, ExecProcess, ExecStdio, SpawnedExec};
    use crate::domain::instance::IdmapConfig;
    use crate::domain::operation::{OperationClass, OperationStatus};
    use crate::infrastructure::event_bus::EventBus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Tracker {
        spawned: AtomicBool,
        reaped: AtomicBool,
        killed: Notify,
        signals: Mutex<Vec<i32>>,
    }

    struct Signals(Arc<Tracker>);

    impl ExecSignaller for Signals {
        fn signal(&self, signal: i32) -> Result<(), ExecError> {
            self.0.signals.lock().push(signal);
            if signal == libc::SIGKILL {
                self.0.killed.notify_one();
            }
            Ok(())
        }
    }

    /// Runs until killed, then fails to report a status.
    struct Hanging(Arc<Tracker>);

    #[async_trait]
    impl ExecProcess for Hanging {
        async fn wait(&mut self) -> Result<i32, ExecError> {
            self.0.killed.notified().await;
            self.0.reaped.store(true, Ordering::SeqCst);
            Err(ExecError::Wait("no child process".to_string()))
        }
    }

    struct HangingRunner(Arc<Tracker>);

    #[async_trait]
    impl ExecRunner for HangingRunner {
        async fn spawn(&self, _: &Instance, _: &ExecRequest) -> Result<SpawnedExec, ExecError> {
            self.0.spawned.store(true, Ordering::SeqCst);
            Ok(SpawnedExec {
                stdio: ExecStdio {
                    stdin: Box::new(tokio::io::sink()),
                    stdout: Box::new(tokio::io::empty()),
                    stderr: Box::new(tokio::io::empty()),
                },
                process: Box::new(Hanging(Arc::clone(&self.0))),
                signaller: Arc::new(Signals(Arc::clone(&self.0))),
            })
        }
    }

    async fn until(flag: &AtomicBool) -> bool {
        for _ in 0..100 {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_cancel_kills_and_reaps_command() {
        let tracker = Arc::new(Tracker::default());
        let registry = OperationRegistry::new(EventBus::new(16), Duration::from_secs(5));
        let session = ExecSession::new(
            Instance::new("c1", "/nonexistent/c1", IdmapConfig::default()),
            ExecRequest {
                command: vec!["sleep".to_string(), "60".to_string()],
                ..Default::default()
            },
            Arc::new(HangingRunner(Arc::clone(&tracker))),
            Duration::from_secs(2),
        );
        let request = OperationRequest::new(OperationClass::Websocket, "Executing command", OperationTask::Exec(session))
            .with_channels(&EXEC_CHANNELS);
        let op = registry.spawn(request).unwrap();

        let secrets = op.render().metadata["fds"].clone();
        let mut ends = Vec::new();
        for name in EXEC_CHANNELS {
            let (local, remote) = ChannelConn::pair(name, 4);
            registry
                .connect(op.id(), secrets[name].as_str().unwrap(), remote)
                .unwrap();
            ends.push(local);
        }
        assert!(until(&tracker.spawned).await);

        let view = registry.cancel(op.id()).await.unwrap();
        assert_eq!(view.status, OperationStatus::Cancelled);
        assert!(until(&tracker.reaped).await);
        assert_eq!(*tracker.signals.lock(), vec![libc::SIGKILL]);
    }
}
