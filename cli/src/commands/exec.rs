// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `lodge exec`: run a command in an instance with local stdio attached.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Args;
use std::collections::HashMap;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use lodge_core::domain::channel::{CONTROL_CHANNEL, STDERR_CHANNEL, STDIN_CHANNEL, STDOUT_CHANNEL};
use lodge_core::infrastructure::channel_io::{copy_reader_to_sink, copy_stream_to_writer};
use lodge_sdk::{ChannelConn, ChannelError, ExecControl, ExecRequest, LodgeClient, OperationStatus};

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[arg(value_name = "INSTANCE")]
    pub instance: String,

    /// Environment variable for the command
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Working directory inside the instance
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl ExecArgs {
    fn request(&self) -> Result<ExecRequest> {
        let mut environment = HashMap::new();
        for pair in &self.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Invalid environment entry {:?}, expected KEY=VALUE", pair))?;
            environment.insert(key.to_string(), value.to_string());
        }
        Ok(ExecRequest {
            command: self.command.clone(),
            environment,
            cwd: self.cwd.clone(),
        })
    }
}

/// Returns the exit code of the remote command.
pub async fn run(args: ExecArgs, endpoint: &str) -> Result<i32> {
    let client = LodgeClient::new(endpoint);
    let view = client
        .exec(&args.instance, &args.request()?)
        .await
        .with_context(|| format!("Failed to exec in {}", args.instance))?;
    debug!(operation_id = %view.id, "Exec operation created");

    let (mut stdin, stdout, stderr, control) = tokio::try_join!(
        client.connect_channel(&view, STDIN_CHANNEL),
        client.connect_channel(&view, STDOUT_CHANNEL),
        client.connect_channel(&view, STDERR_CHANNEL),
        client.connect_channel(&view, CONTROL_CHANNEL),
    )
    .context("Failed to attach to exec channels")?;

    let input = tokio::spawn(async move {
        let name = stdin.name().to_string();
        let (sink, _, cancel) = stdin.parts_mut();
        let cancel = cancel.clone();
        copy_reader_to_sink(tokio::io::stdin(), sink, &cancel, &name).await
    });
    let signals = tokio::spawn(forward_interrupts(control));

    let (out, err) = tokio::join!(
        drain(stdout, tokio::io::stdout()),
        drain(stderr, tokio::io::stderr())
    );
    for result in [out, err] {
        if let Err(e) = result {
            warn!(error = %e, "Output channel closed early");
        }
    }

    let finished = client
        .wait_operation(view.id, None)
        .await
        .context("Failed to wait for exec")?;
    input.abort();
    signals.abort();

    if finished.status != OperationStatus::Success {
        anyhow::bail!("Exec {}: {}", finished.status.to_string().to_lowercase(), finished.err);
    }
    let code = finished
        .metadata
        .get("return")
        .and_then(|v| v.as_i64())
        .context("Exec finished without an exit code")?;
    Ok(code as i32)
}

async fn drain<W: AsyncWrite + Unpin>(mut conn: ChannelConn, writer: W) -> Result<u64, ChannelError> {
    let name = conn.name().to_string();
    let (_, stream, cancel) = conn.parts_mut();
    let cancel = cancel.clone();
    copy_stream_to_writer(stream, writer, &cancel, &name).await
}

/// Ctrl+C is passed to the remote command instead of ending this process.
async fn forward_interrupts(mut control: ChannelConn) {
    while tokio::signal::ctrl_c().await.is_ok() {
        if let Err(e) = control.send(signal_frame(SIGINT)).await {
            warn!(error = %e, "Failed to forward interrupt");
            return;
        }
    }
}

#[cfg(unix)]
const SIGINT: i32 = libc::SIGINT;
#[cfg(not(unix))]
const SIGINT: i32 = 2;

fn signal_frame(signal: i32) -> Bytes {
    serde_json::to_vec(&ExecControl::signal(signal))
        .map(Bytes::from)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: ExecArgs,
    }

    #[test]
    fn test_command_follows_separator() {
        let parsed = Harness::try_parse_from([
            "exec", "web", "-e", "TERM=xterm", "--", "sh", "-c", "echo hi",
        ])
        .unwrap();
        let request = parsed.args.request().unwrap();
        assert_eq!(request.command, vec!["sh", "-c", "echo hi"]);
        assert_eq!(request.environment["TERM"], "xterm");
    }

    #[test]
    fn test_bad_environment_entry() {
        let parsed = Harness::try_parse_from(["exec", "web", "-e", "TERM", "--", "true"]).unwrap();
        assert!(parsed.args.request().is_err());
    }

    #[test]
    fn test_signal_frame_is_control_json() {
        let decoded: ExecControl = serde_json::from_slice(&signal_frame(2)).unwrap();
        assert_eq!(decoded, ExecControl::signal(2));
    }
}
