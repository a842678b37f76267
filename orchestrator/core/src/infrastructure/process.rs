// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host process runner for exec sessions.

use crate::domain::exec::{
    ExecError, ExecProcess, ExecRequest, ExecRunner, ExecSignaller, ExecStdio, SpawnedExec,
};
use crate::domain::instance::Instance;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::debug;

/// Runs exec commands as host processes, by default inside the instance's
/// root filesystem directory.
#[derive(Debug, Clone, Default)]
pub struct HostExecRunner;

impl HostExecRunner {
    pub fn new() -> Self {
        Self
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ExecProcess for ChildProcess {
    async fn wait(&mut self) -> Result<i32, ExecError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecError::Wait(e.to_string()))?;
        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        })
    }
}

struct PidSignaller {
    pid: Option<u32>,
}

impl ExecSignaller for PidSignaller {
    fn signal(&self, signal: i32) -> Result<(), ExecError> {
        let pid = self
            .pid
            .and_then(|p| libc::pid_t::try_from(p).ok())
            .ok_or_else(|| ExecError::Signal("process has no pid".to_string()))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(ExecError::Signal(std::io::Error::last_os_error().to_string()))
        }
    }
}

#[async_trait]
impl ExecRunner for HostExecRunner {
    async fn spawn(&self, instance: &Instance, request: &ExecRequest) -> Result<SpawnedExec, ExecError> {
        request.validate()?;
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| ExecError::InvalidRequest("command must not be empty".to_string()))?;

        let cwd = match &request.cwd {
            Some(cwd) => std::path::PathBuf::from(cwd),
            None if instance.rootfs().is_dir() => instance.rootfs(),
            None => instance.root_path.clone(),
        };

        let mut child = Command::new(program)
            .args(args)
            .envs(&request.environment)
            .current_dir(&cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn(format!("{}: {}", program, e)))?;

        debug!(instance = %instance.name, program, pid = ?child.id(), "Exec process started");

        let missing = |stream: &str| ExecError::Spawn(format!("{} unavailable", stream));
        let stdio = ExecStdio {
            stdin: Box::new(child.stdin.take().ok_or_else(|| missing("stdin"))?),
            stdout: Box::new(child.stdout.take().ok_or_else(|| missing("stdout"))?),
            stderr: Box::new(child.stderr.take().ok_or_else(|| missing("stderr"))?),
        };
        let signaller = Arc::new(PidSignaller { pid: child.id() });

        Ok(SpawnedExec {
            stdio,
            process: Box::new(ChildProcess { child }),
            signaller,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::IdmapConfig;
    use tokio::io::AsyncReadExt;

    fn instance(dir: &std::path::Path) -> Instance {
        Instance::new("c1", dir, IdmapConfig::default())
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest {
            command: vec!["sh".into(), "-c".into(), "echo out; echo err >&2; exit 3".into()],
            ..Default::default()
        };
        let mut spawned = HostExecRunner::new()
            .spawn(&instance(dir.path()), &request)
            .await
            .unwrap();

        let mut out = String::new();
        spawned.stdio.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        spawned.stdio.stderr.read_to_string(&mut err).await.unwrap();

        assert_eq!(spawned.process.wait().await.unwrap(), 3);
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");
    }

    #[tokio::test]
    async fn test_signal_reports_128_plus_n() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest {
            command: vec!["sleep".into(), "30".into()],
            ..Default::default()
        };
        let mut spawned = HostExecRunner::new()
            .spawn(&instance(dir.path()), &request)
            .await
            .unwrap();
        spawned.signaller.signal(libc::SIGTERM).unwrap();
        assert_eq!(spawned.process.wait().await.unwrap(), 128 + libc::SIGTERM);
    }
}
