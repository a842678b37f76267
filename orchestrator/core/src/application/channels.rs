// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Channel table of a websocket operation.
//!
//! Each named channel has a secret and moves Unopened -> Open -> Consumed.
//! A connecting peer claims an Unopened entry by secret and hands its
//! connection over; the operation's task accepts it by name. One
//! cancellation token closes every channel of the table.

use crate::domain::channel::{ChannelConn, ChannelError, ChannelSecret, ChannelState};
use crate::domain::operation::OperationError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct ChannelEntry {
    name: String,
    secret: ChannelSecret,
    state: ChannelState,
    sender: Option<oneshot::Sender<ChannelConn>>,
    receiver: Option<oneshot::Receiver<ChannelConn>>,
}

pub struct ChannelTable {
    entries: Mutex<Vec<ChannelEntry>>,
    cancel: CancellationToken,
}

/// A claimed channel, ready to receive the peer's connection.
#[derive(Debug)]
pub struct ChannelClaim {
    name: String,
    sender: oneshot::Sender<ChannelConn>,
}

impl ChannelClaim {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand the connection to the operation's task.
    pub fn deliver(self, mut conn: ChannelConn) -> Result<(), ChannelError> {
        conn.set_name(self.name.clone());
        self.sender
            .send(conn)
            .map_err(|_| ChannelError::Closed)
    }
}

impl ChannelTable {
    pub fn new<S: AsRef<str>>(names: &[S], cancel: CancellationToken) -> Result<Self, OperationError> {
        if names.is_empty() {
            return Err(OperationError::InvalidDefinition(
                "websocket operations need at least one channel".to_string(),
            ));
        }

        let mut entries: Vec<ChannelEntry> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if name.is_empty() || entries.iter().any(|e| e.name == name) {
                return Err(OperationError::InvalidDefinition(format!(
                    "invalid or duplicate channel name {:?}",
                    name
                )));
            }
            let (sender, receiver) = oneshot::channel();
            entries.push(ChannelEntry {
                name: name.to_string(),
                secret: ChannelSecret::generate(),
                state: ChannelState::Unopened,
                sender: Some(sender),
                receiver: Some(receiver),
            });
        }

        Ok(Self {
            entries: Mutex::new(entries),
            cancel,
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Channel name to secret, as published in operation metadata.
    pub fn secrets(&self) -> Map<String, Value> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.name.clone(), Value::String(e.secret.as_str().to_string())))
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<ChannelState> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.state)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Unblock every pending accept and every in-flight read and write.
    pub fn close_all(&self) {
        self.cancel.cancel();
    }

    /// Claim the Unopened entry whose secret is `presented`.
    pub fn claim(&self, presented: &str) -> Result<ChannelClaim, ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::InvalidSecret);
        }

        let mut entries = self.entries.lock();
        // Compare against every entry so timing does not reveal which matched.
        let mut matched = None;
        for (idx, entry) in entries.iter().enumerate() {
            if entry.secret.matches(presented) && matched.is_none() {
                matched = Some(idx);
            }
        }

        let Some(idx) = matched else {
            return Err(ChannelError::InvalidSecret);
        };
        let entry = &mut entries[idx];
        if entry.state != ChannelState::Unopened {
            return Err(ChannelError::InvalidSecret);
        }
        let sender = entry.sender.take().ok_or(ChannelError::InvalidSecret)?;
        entry.state = ChannelState::Open;
        debug!(channel = %entry.name, "Channel claimed");

        Ok(ChannelClaim {
            name: entry.name.clone(),
            sender,
        })
    }

    /// Wait for the peer to open `name`, at most `timeout`.
    pub async fn accept(&self, name: &str, timeout: Duration) -> Result<ChannelConn, ChannelError> {
        let receiver = {
            let mut entries = self.entries.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.name == name)
                .ok_or_else(|| ChannelError::Unknown(name.to_string()))?;
            entry
                .receiver
                .take()
                .ok_or_else(|| ChannelError::AlreadyTaken(name.to_string()))?
        };

        let conn = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ChannelError::Cancelled(name.to_string())),
            res = tokio::time::timeout(timeout, receiver) => match res {
                Err(_) => return Err(ChannelError::ConnectTimeout(name.to_string())),
                Ok(Err(_)) => return Err(ChannelError::Closed),
                Ok(Ok(conn)) => conn,
            },
        };

        if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.name == name) {
            entry.state = ChannelState::Consumed;
        }
        debug!(channel = name, "Channel connected");
        Ok(conn.with_cancel(self.cancel.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn table(names: &[&str]) -> ChannelTable {
        ChannelTable::new(names, CancellationToken::new()).unwrap()
    }

    fn secret_of(table: &ChannelTable, name: &str) -> String {
        table.secrets()[name].as_str().unwrap().to_string()
    }

    #[test]
    fn test_definition_is_validated() {
        let none: [&str; 0] = [];
        assert!(ChannelTable::new(&none, CancellationToken::new()).is_err());
        assert!(ChannelTable::new(&["fs", "fs"], CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_claim_then_accept() {
        let table = table(&["control", "fs"]);
        let secret = secret_of(&table, "fs");

        let claim = table.claim(&secret).unwrap();
        assert_eq!(claim.name(), "fs");
        assert_eq!(table.state("fs"), Some(ChannelState::Open));

        let (local, mut remote) = ChannelConn::pair("peer", 4);
        claim.deliver(local).unwrap();

        let mut conn = table.accept("fs", Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.name(), "fs");
        assert_eq!(table.state("fs"), Some(ChannelState::Consumed));

        remote.send(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"data")));
    }

    #[test]
    fn test_reused_secret_looks_unknown() {
        let table = table(&["control"]);
        let secret = secret_of(&table, "control");
        let _claim = table.claim(&secret).unwrap();

        assert_eq!(table.claim(&secret).unwrap_err(), ChannelError::InvalidSecret);
        assert_eq!(table.claim("deadbeef").unwrap_err(), ChannelError::InvalidSecret);
    }

    #[tokio::test]
    async fn test_unopened_channel_times_out() {
        let table = table(&["criu"]);
        assert_eq!(
            table.accept("criu", Duration::from_millis(20)).await.unwrap_err(),
            ChannelError::ConnectTimeout("criu".to_string())
        );
        assert_eq!(
            table.accept("criu", Duration::from_millis(20)).await.unwrap_err(),
            ChannelError::AlreadyTaken("criu".to_string())
        );
    }

    #[tokio::test]
    async fn test_close_all_unblocks_accept_and_refuses_claims() {
        let table = std::sync::Arc::new(table(&["control"]));
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.accept("control", Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        table.close_all();

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            ChannelError::Cancelled("control".to_string())
        );
        let secret = secret_of(&table, "control");
        assert_eq!(table.claim(&secret).unwrap_err(), ChannelError::InvalidSecret);
    }
}
