// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Rsync filesystem transport.
//!
//! The receiving side runs `rsync --server` with its stdio bridged onto the
//! channel. The sending side runs a regular rsync client whose remote shell is
//! `<lodge> netcat <socket>`: the hidden netcat command copies stdio to a unix
//! socket that this process accepts and bridges onto the channel.

use crate::domain::channel::ChannelConn;
use crate::domain::migration::{FsTransport, MigrationError, MigrationFsType, RsyncFeatureSet};
use crate::infrastructure::channel_io::{bridge, copy_reader_to_sink, copy_stream_to_writer};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tracing::{debug, info};
use uuid::Uuid;

/// How long the rsync client gets to dial back through netcat.
const NETCAT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

fn transfer_error(context: &str, e: impl std::fmt::Display) -> MigrationError {
    MigrationError::Transfer(format!("{}: {}", context, e))
}

#[derive(Debug, Clone)]
pub struct RsyncTransport {
    binary: String,
    /// Executable providing the hidden `netcat` command.
    netcat_exe: PathBuf,
    bwlimit: Option<String>,
}

impl RsyncTransport {
    pub fn new(binary: impl Into<String>, netcat_exe: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            netcat_exe: netcat_exe.into(),
            bwlimit: None,
        }
    }

    pub fn with_bwlimit(mut self, bwlimit: Option<String>) -> Self {
        self.bwlimit = bwlimit;
        self
    }

    /// Arguments of the sending client.
    pub fn send_args(&self, path: &Path, features: &RsyncFeatureSet, socket: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-ar", "--devices", "--numeric-ids", "--partial", "--sparse"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(features.rsync_args());
        if let Some(limit) = &self.bwlimit {
            args.push(format!("--bwlimit={}", limit));
        }
        args.push("-e".to_string());
        args.push(format!(
            "{} netcat {}",
            self.netcat_exe.display(),
            socket.display()
        ));
        args.push(format!("{}/", path.display()));
        // Host and path are ignored by the netcat remote shell.
        args.push("localhost:/tmp/lodge-rsync".to_string());
        args
    }

    /// Arguments of the receiving server.
    pub fn recv_args(&self, path: &Path, features: &RsyncFeatureSet) -> Vec<String> {
        let mut args: Vec<String> = [
            "--server",
            "-vlogDtpre.iLsfx",
            "--numeric-ids",
            "--devices",
            "--partial",
            "--sparse",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(features.rsync_args());
        args.push(".".to_string());
        args.push(format!("{}/", path.display()));
        args
    }

    fn spawn(&self, args: &[String], stdin: Stdio, stdout: Stdio) -> Result<Child, MigrationError> {
        debug!(binary = %self.binary, ?args, "Spawning rsync");
        Command::new(&self.binary)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| transfer_error("failed to start rsync", e))
    }
}

async fn collect_stderr<R: AsyncRead + Unpin>(stderr: Option<R>) -> String {
    let mut out = Vec::new();
    if let Some(mut stderr) = stderr {
        if let Err(e) = stderr.read_to_end(&mut out).await {
            debug!(error = %e, "Failed to read rsync stderr");
        }
    }
    String::from_utf8_lossy(&out).trim().to_string()
}

fn check_exit(status: ExitStatus, stderr: String) -> Result<(), MigrationError> {
    if status.success() {
        Ok(())
    } else if stderr.is_empty() {
        Err(MigrationError::Transfer(format!("rsync exited with {}", status)))
    } else {
        Err(MigrationError::Transfer(format!(
            "rsync exited with {}: {}",
            status, stderr
        )))
    }
}

#[async_trait]
impl FsTransport for RsyncTransport {
    fn fs_type(&self) -> MigrationFsType {
        MigrationFsType::Rsync
    }

    async fn send(
        &self,
        path: &Path,
        conn: &mut ChannelConn,
        features: &RsyncFeatureSet,
    ) -> Result<(), MigrationError> {
        let socket_path = std::env::temp_dir().join(format!("lodge-rsync-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| transfer_error("failed to listen for rsync", e))?;
        let result = self.send_via(&listener, path, conn, features, &socket_path).await;
        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!(path = %socket_path.display(), error = %e, "Failed to remove rsync socket");
        }
        result
    }

    async fn recv(
        &self,
        path: &Path,
        conn: &mut ChannelConn,
        features: &RsyncFeatureSet,
    ) -> Result<(), MigrationError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| transfer_error("failed to create target directory", e))?;

        let args = self.recv_args(path, features);
        let mut child = self.spawn(&args, Stdio::piped(), Stdio::piped())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MigrationError::Transfer("rsync stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MigrationError::Transfer("rsync stdout unavailable".to_string()))?;
        let stderr = tokio::spawn(collect_stderr(child.stderr.take()));

        let name = conn.name().to_string();
        let (sink, stream, cancel) = conn.parts_mut();
        let cancel = cancel.clone();

        // The process exit and its output decide completion; the inbound
        // pump is dropped once rsync is gone.
        let inbound = copy_stream_to_writer(stream, stdin, &cancel, &name);
        tokio::pin!(inbound);
        let work = async {
            let (out, status) = tokio::join!(copy_reader_to_sink(stdout, sink, &cancel, &name), child.wait());
            (out, status)
        };
        tokio::pin!(work);

        let mut inbound_done = false;
        let (out, status) = loop {
            tokio::select! {
                res = &mut work => break res,
                res = &mut inbound, if !inbound_done => {
                    inbound_done = true;
                    res?;
                }
            }
        };

        let status = status.map_err(|e| transfer_error("failed to wait for rsync", e))?;
        let stderr = stderr.await.unwrap_or_default();
        check_exit(status, stderr)?;
        let received = out?;
        info!(path = %path.display(), bytes_sent = received, "Rsync receive completed");
        Ok(())
    }
}

impl RsyncTransport {
    async fn send_via(
        &self,
        listener: &UnixListener,
        path: &Path,
        conn: &mut ChannelConn,
        features: &RsyncFeatureSet,
        socket_path: &Path,
    ) -> Result<(), MigrationError> {
        let args = self.send_args(path, features, socket_path);
        let mut child = self.spawn(&args, Stdio::null(), Stdio::null())?;
        let stderr = tokio::spawn(collect_stderr(child.stderr.take()));

        let accepted = tokio::select! {
            res = tokio::time::timeout(NETCAT_ACCEPT_TIMEOUT, listener.accept()) => res,
            status = child.wait() => {
                let status = status.map_err(|e| transfer_error("failed to wait for rsync", e))?;
                let stderr = stderr.await.unwrap_or_default();
                check_exit(status, stderr)?;
                return Err(MigrationError::Transfer("rsync exited before connecting".to_string()));
            }
        };
        let (socket, _) = accepted
            .map_err(|_| MigrationError::Transfer("rsync did not connect back".to_string()))?
            .map_err(|e| transfer_error("failed to accept rsync connection", e))?;

        let (read_half, write_half) = socket.into_split();
        let (bridged, status) = tokio::join!(bridge(conn, read_half, write_half), child.wait());

        let status = status.map_err(|e| transfer_error("failed to wait for rsync", e))?;
        let stderr = stderr.await.unwrap_or_default();
        check_exit(status, stderr)?;
        bridged?;
        info!(path = %path.display(), "Rsync send completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> RsyncFeatureSet {
        RsyncFeatureSet {
            xattrs: true,
            delete: true,
            compress: false,
            bidirectional: true,
        }
    }

    #[test]
    fn test_recv_args() {
        let transport = RsyncTransport::new("rsync", "/usr/bin/lodge");
        let args = transport.recv_args(Path::new("/srv/c1/rootfs"), &features());
        assert_eq!(
            args,
            vec![
                "--server",
                "-vlogDtpre.iLsfx",
                "--numeric-ids",
                "--devices",
                "--partial",
                "--sparse",
                "--xattrs",
                "--delete",
                ".",
                "/srv/c1/rootfs/",
            ]
        );
    }

    #[test]
    fn test_send_args_use_netcat_shell() {
        let transport = RsyncTransport::new("rsync", "/usr/bin/lodge").with_bwlimit(Some("1024".into()));
        let args = transport.send_args(
            Path::new("/srv/c1/rootfs"),
            &RsyncFeatureSet {
                compress: true,
                ..Default::default()
            },
            Path::new("/tmp/x.sock"),
        );
        assert_eq!(&args[..5], &["-ar", "--devices", "--numeric-ids", "--partial", "--sparse"]);
        assert!(args.contains(&"--compress".to_string()));
        assert!(args.contains(&"--compress-level=2".to_string()));
        assert!(args.contains(&"--bwlimit=1024".to_string()));
        let shell = args.iter().position(|a| a == "-e").unwrap();
        assert_eq!(args[shell + 1], "/usr/bin/lodge netcat /tmp/x.sock");
        assert_eq!(args[args.len() - 2], "/srv/c1/rootfs/");
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed")))
        }
    }

    #[tokio::test]
    async fn test_stderr_keeps_non_utf8_output() {
        let raw: &[u8] = b"rsync: failed \xff\xfe on file\n";
        let message = collect_stderr(Some(raw)).await;
        assert!(message.starts_with("rsync: failed"));
        assert!(message.ends_with("on file"));
    }

    #[tokio::test]
    async fn test_unreadable_stderr_yields_empty_message() {
        assert_eq!(collect_stderr(Some(BrokenPipe)).await, "");
        assert_eq!(collect_stderr(None::<BrokenPipe>).await, "");
        let status = std::process::Command::new("false").status().unwrap();
        let err = check_exit(status, String::new()).unwrap_err();
        assert!(err.to_string().contains("rsync exited with"));
    }
}
