// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process dialer: connects to channels of operations held by a local
//! registry through in-memory pairs instead of websockets.

use crate::application::operations::OperationRegistry;
use crate::domain::channel::{ChannelConn, ChannelDialer, ChannelError, RemoteOperation};
use crate::domain::operation::OperationError;
use async_trait::async_trait;

const PAIR_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct LoopbackDialer {
    registry: OperationRegistry,
}

impl LoopbackDialer {
    pub fn new(registry: OperationRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ChannelDialer for LoopbackDialer {
    async fn dial(&self, target: &RemoteOperation, channel: &str) -> Result<ChannelConn, ChannelError> {
        let secret = target.secret(channel)?;
        let (local, remote) = ChannelConn::pair(channel, PAIR_CAPACITY);
        match self.registry.connect(target.operation_id, secret, remote) {
            Ok(_) => Ok(local),
            Err(OperationError::Channel(e)) => Err(e),
            Err(e) => Err(ChannelError::Transport(e.to_string())),
        }
    }
}
