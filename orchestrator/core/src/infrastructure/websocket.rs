// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Websocket adapters for operation channels.
//!
//! Server side: an upgraded axum `WebSocket`. Client side: a
//! `tokio-tungstenite` stream dialed against a remote daemon. Both become a
//! [`ChannelConn`] carrying binary frames; a close frame ends the stream.

use crate::domain::channel::{ChannelConn, ChannelDialer, ChannelError, RemoteOperation};
use crate::domain::operation::API_VERSION;
use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::Url;

fn transport_error(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

/// Wrap an upgraded server-side socket.
pub fn conn_from_axum(name: &str, socket: WebSocket) -> ChannelConn {
    let (tx, rx) = socket.split();

    let sink = tx
        .sink_map_err(transport_error)
        .with(|frame: Bytes| future::ready(Ok::<_, ChannelError>(AxumMessage::Binary(frame))));

    let stream = rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(AxumMessage::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(AxumMessage::Binary(data)) => Some(Ok(data)),
                Ok(AxumMessage::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(transport_error(e))),
            })
        });

    ChannelConn::new(name, Box::pin(sink), Box::pin(stream))
}

/// Wrap a client-side tungstenite stream.
pub fn conn_from_tungstenite<S>(name: &str, ws: WebSocketStream<S>) -> ChannelConn
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = ws.split();

    let sink = tx
        .sink_map_err(transport_error)
        .with(|frame: Bytes| future::ready(Ok::<_, ChannelError>(WsMessage::Binary(frame))));

    let stream = rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(WsMessage::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Binary(data)) => Some(Ok(data)),
                Ok(WsMessage::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(_) => None,
                Err(e) => Some(Err(transport_error(e))),
            })
        });

    ChannelConn::new(name, Box::pin(sink), Box::pin(stream))
}

/// `ws(s)://<endpoint>/1.0/operations/<id>/websocket?secret=<secret>`
pub fn channel_url(target: &RemoteOperation, channel: &str) -> Result<Url, ChannelError> {
    let secret = target.secret(channel)?;
    let endpoint = target.endpoint.as_str();
    let mut url = Url::parse(endpoint).map_err(transport_error)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ChannelError::Transport(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::Transport(format!("cannot use scheme {} for {}", scheme, endpoint)))?;
    url.set_path(&format!(
        "/{}/operations/{}/websocket",
        API_VERSION, target.operation_id
    ));
    url.query_pairs_mut().clear().append_pair("secret", secret);
    Ok(url)
}

/// Dials channels of operations on other daemons over the network.
#[derive(Debug, Clone, Default)]
pub struct WebsocketDialer;

impl WebsocketDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelDialer for WebsocketDialer {
    async fn dial(&self, target: &RemoteOperation, channel: &str) -> Result<ChannelConn, ChannelError> {
        let url = channel_url(target, channel)?;
        debug!(operation_id = %target.operation_id, channel, "Dialing operation channel");
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(transport_error)?;
        Ok(conn_from_tungstenite(channel, ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::operation::OperationId;
    use std::collections::HashMap;

    #[test]
    fn test_channel_url() {
        let target = RemoteOperation {
            endpoint: "http://10.0.0.2:8443".to_string(),
            operation_id: OperationId::new(),
            secrets: HashMap::from([("fs".to_string(), "abc".to_string())]),
        };
        let url = channel_url(&target, "fs").unwrap();
        assert_eq!(
            url.as_str(),
            format!(
                "ws://10.0.0.2:8443/1.0/operations/{}/websocket?secret=abc",
                target.operation_id
            )
        );
        assert!(matches!(channel_url(&target, "criu"), Err(ChannelError::Unknown(_))));
    }

    #[test]
    fn test_channel_url_rejects_unknown_scheme() {
        let target = RemoteOperation {
            endpoint: "ftp://host".to_string(),
            operation_id: OperationId::new(),
            secrets: HashMap::from([("control".to_string(), "x".to_string())]),
        };
        assert!(channel_url(&target, "control").is_err());
    }
}
