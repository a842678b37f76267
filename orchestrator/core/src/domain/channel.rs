// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operation Channels
//!
//! A channel is one named, secret-keyed websocket attached to a websocket
//! operation. This module holds the transport-agnostic connection handle, the
//! secret type and the per-channel lifecycle state.

use crate::domain::operation::OperationId;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender};

pub const CONTROL_CHANNEL: &str = "control";
pub const FS_CHANNEL: &str = "fs";
pub const CRIU_CHANNEL: &str = "criu";
pub const STDIN_CHANNEL: &str = "0";
pub const STDOUT_CHANNEL: &str = "1";
pub const STDERR_CHANNEL: &str = "2";

const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    /// Unknown secret and reused secret are deliberately indistinguishable.
    #[error("Invalid channel secret")]
    InvalidSecret,
    #[error("Timed out waiting for channel {0} to connect")]
    ConnectTimeout(String),
    #[error("Channel {0} was already taken")]
    AlreadyTaken(String),
    #[error("Unknown channel {0}")]
    Unknown(String),
    #[error("Channel {0} was cancelled")]
    Cancelled(String),
    #[error("Websocket error: {0}")]
    Transport(String),
}

/// Lifecycle of a single channel entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Unopened,
    Open,
    Consumed,
}

/// 32 random bytes, hex encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelSecret(String);

impl ChannelSecret {
    pub fn generate() -> Self {
        let mut raw = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut raw);
        Self(hex::encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented secret.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

impl From<String> for ChannelSecret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for ChannelSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelSecret(..)")
    }
}

pub type ChannelSink = Pin<Box<dyn Sink<Bytes, Error = ChannelError> + Send>>;
pub type ChannelStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChannelError>> + Send>>;

/// A bidirectional, message-oriented connection bound to one channel.
///
/// Reads and writes abort with [`ChannelError::Cancelled`] once the attached
/// cancellation token fires.
pub struct ChannelConn {
    name: String,
    sink: ChannelSink,
    stream: ChannelStream,
    cancel: CancellationToken,
}

impl ChannelConn {
    pub fn new(name: impl Into<String>, sink: ChannelSink, stream: ChannelStream) -> Self {
        Self {
            name: name.into(),
            sink,
            stream,
            cancel: CancellationToken::new(),
        }
    }

    /// Two connected in-memory ends. Frames sent on one arrive on the other.
    pub fn pair(name: &str, capacity: usize) -> (ChannelConn, ChannelConn) {
        let (a_tx, a_rx) = mpsc::channel::<Bytes>(capacity);
        let (b_tx, b_rx) = mpsc::channel::<Bytes>(capacity);
        (
            Self::from_mpsc(name, a_tx, b_rx),
            Self::from_mpsc(name, b_tx, a_rx),
        )
    }

    fn from_mpsc(name: &str, tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        let sink = PollSender::new(tx).sink_map_err(|_| ChannelError::Closed);
        let stream = ReceiverStream::new(rx).map(Ok);
        Self::new(name, Box::pin(sink), Box::pin(stream))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Attach the cancellation token that aborts in-flight reads and writes.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn send(&mut self, frame: Bytes) -> Result<(), ChannelError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled(self.name.clone())),
            res = self.sink.send(frame) => res,
        }
    }

    /// Next frame, or `None` once the peer closed its side.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, ChannelError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Cancelled(self.name.clone())),
            frame = self.stream.next() => frame.transpose(),
        }
    }

    /// Close the write side. The peer observes end-of-stream.
    pub async fn close(&mut self) -> Result<(), ChannelError> {
        self.sink.close().await
    }

    /// Borrow both halves at once for full-duplex pumping.
    pub fn parts_mut(&mut self) -> (&mut ChannelSink, &mut ChannelStream, &CancellationToken) {
        (&mut self.sink, &mut self.stream, &self.cancel)
    }
}

impl fmt::Debug for ChannelConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConn").field("name", &self.name).finish()
    }
}

/// A websocket operation on some daemon, as seen by the side that connects
/// to its channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOperation {
    /// Base URL of the daemon, e.g. `http://10.0.0.2:8443`.
    pub endpoint: String,
    pub operation_id: OperationId,
    /// Channel name to secret.
    pub secrets: HashMap<String, String>,
}

impl RemoteOperation {
    pub fn secret(&self, channel: &str) -> Result<&str, ChannelError> {
        self.secrets
            .get(channel)
            .map(String::as_str)
            .ok_or_else(|| ChannelError::Unknown(channel.to_string()))
    }
}

/// Opens the client end of a remote operation's channel.
#[async_trait]
pub trait ChannelDialer: Send + Sync {
    async fn dial(&self, target: &RemoteOperation, channel: &str) -> Result<ChannelConn, ChannelError>;
}
