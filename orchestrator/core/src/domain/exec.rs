// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Exec sessions: a command run on behalf of an instance, with stdio carried
//! over operation channels "0", "1" and "2" and signals over "control".

use crate::domain::instance::Instance;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Invalid exec request: {0}")]
    InvalidRequest(String),
    #[error("Failed to start command: {0}")]
    Spawn(String),
    #[error("Failed to wait for command: {0}")]
    Wait(String),
    #[error("Failed to signal command: {0}")]
    Signal(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl ExecRequest {
    pub fn validate(&self) -> Result<(), ExecError> {
        match self.command.first() {
            Some(program) if !program.is_empty() => Ok(()),
            _ => Err(ExecError::InvalidRequest("command must not be empty".to_string())),
        }
    }
}

/// JSON message on the exec "control" channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecControl {
    pub command: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
    #[serde(default)]
    pub signal: i32,
}

impl ExecControl {
    pub fn signal(signal: i32) -> Self {
        Self {
            command: "signal".to_string(),
            args: HashMap::new(),
            signal,
        }
    }
}

pub type ExecInput = Box<dyn AsyncWrite + Send + Unpin>;
pub type ExecOutput = Box<dyn AsyncRead + Send + Unpin>;

pub struct ExecStdio {
    pub stdin: ExecInput,
    pub stdout: ExecOutput,
    pub stderr: ExecOutput,
}

/// Delivers signals to a running command.
pub trait ExecSignaller: Send + Sync {
    fn signal(&self, signal: i32) -> Result<(), ExecError>;
}

#[async_trait]
pub trait ExecProcess: Send {
    /// Exit code; death by signal `n` reports `128 + n`.
    async fn wait(&mut self) -> Result<i32, ExecError>;
}

pub struct SpawnedExec {
    pub stdio: ExecStdio,
    pub process: Box<dyn ExecProcess>,
    pub signaller: Arc<dyn ExecSignaller>,
}

#[async_trait]
pub trait ExecRunner: Send + Sync {
    async fn spawn(&self, instance: &Instance, request: &ExecRequest) -> Result<SpawnedExec, ExecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(ExecRequest::default().validate().is_err());
        let req = ExecRequest {
            command: vec!["true".to_string()],
            ..Default::default()
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_control_message_format() {
        let msg: ExecControl = serde_json::from_str(r#"{"command":"signal","signal":15}"#).unwrap();
        assert_eq!(msg, ExecControl::signal(15));
    }
}
