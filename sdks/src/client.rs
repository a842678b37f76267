// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::types::*;
use lodge_core::application::operations::CHANNEL_SECRETS_KEY;
use lodge_core::domain::channel::ChannelDialer;
use lodge_core::infrastructure::websocket::WebsocketDialer;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Client for one Lodge daemon.
#[derive(Debug, Clone)]
pub struct LodgeClient {
    base_url: String,
    client: Client,
}

impl LodgeClient {
    /// `base_url` is the daemon endpoint, e.g. `http://10.0.0.2:8443`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "Daemon request");

        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let envelope: ApiResponse = serde_json::from_str(&text)
            .map_err(|e| SdkError::Decode(format!("HTTP {} from {}: {}", status, url, e)))?;
        into_result(envelope)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        decode(self.request::<()>(Method::GET, path, None).await?)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        decode(self.request(Method::POST, path, Some(body)).await?)
    }

    // Operations

    pub async fn list_operations(&self) -> Result<Vec<OperationView>> {
        self.get("/1.0/operations").await
    }

    pub async fn get_operation(&self, id: OperationId) -> Result<OperationView> {
        self.get(&id.url()).await
    }

    pub async fn cancel_operation(&self, id: OperationId) -> Result<OperationView> {
        decode(self.request::<()>(Method::DELETE, &id.url(), None).await?)
    }

    /// Blocks until the operation is final. `None` waits without a bound.
    pub async fn wait_operation(&self, id: OperationId, timeout: Option<Duration>) -> Result<OperationView> {
        let secs = timeout.map(|t| t.as_secs() as i64).unwrap_or(-1);
        self.get(&format!("{}/wait?timeout={}", id.url(), secs)).await
    }

    // Instances

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.get("/1.0/instances").await
    }

    pub async fn get_instance(&self, name: &str) -> Result<Instance> {
        self.get(&instance_path(name, "")).await
    }

    pub async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<Instance> {
        self.post("/1.0/instances", request).await
    }

    pub async fn delete_instance(&self, name: &str) -> Result<()> {
        self.request::<()>(Method::DELETE, &instance_path(name, ""), None)
            .await
            .map(|_| ())
    }

    pub async fn start_instance(&self, name: &str) -> Result<Instance> {
        self.post(&instance_path(name, "/start"), &serde_json::json!({})).await
    }

    pub async fn stop_instance(&self, name: &str) -> Result<Instance> {
        self.post(&instance_path(name, "/stop"), &serde_json::json!({})).await
    }

    /// Starts a command; attach to channels "0", "1", "2" and "control".
    pub async fn exec(&self, name: &str, request: &ExecRequest) -> Result<OperationView> {
        self.post(&instance_path(name, "/exec"), request).await
    }

    /// Creates the receiving end of a migration on this daemon.
    pub async fn migration_sink(&self, name: &str, request: &MigrationSinkRequest) -> Result<OperationView> {
        self.post(&instance_path(name, "/migration/sink"), request).await
    }

    /// Asks this daemon to push `name` into a sink operation on another one.
    pub async fn migration_source(&self, name: &str, request: &MigrationSourceRequest) -> Result<OperationView> {
        self.post(&instance_path(name, "/migration/source"), request).await
    }

    // Channels

    /// Addresses a websocket operation of this daemon for a dialer.
    pub fn remote_operation(&self, view: &OperationView) -> Result<RemoteOperation> {
        remote_operation(&self.base_url, view)
    }

    pub async fn connect_channel(&self, view: &OperationView, channel: &str) -> Result<ChannelConn> {
        let target = self.remote_operation(view)?;
        Ok(WebsocketDialer::new().dial(&target, channel).await?)
    }
}

fn instance_path(name: &str, suffix: &str) -> String {
    format!("/1.0/instances/{}{}", name, suffix)
}

fn into_result(envelope: ApiResponse) -> Result<ApiResponse> {
    match envelope.kind {
        ResponseType::Error => Err(SdkError::Api {
            code: envelope.error_code,
            message: envelope.error,
        }),
        _ => Ok(envelope),
    }
}

fn decode<T: DeserializeOwned>(envelope: ApiResponse) -> Result<T> {
    envelope
        .metadata_as()
        .map_err(|e| SdkError::Decode(e.to_string()))
}

pub fn remote_operation(endpoint: &str, view: &OperationView) -> Result<RemoteOperation> {
    let secrets: HashMap<String, String> = view
        .metadata
        .get(CHANNEL_SECRETS_KEY)
        .and_then(|fds| fds.as_object())
        .ok_or(SdkError::MissingSecrets(view.id))?
        .iter()
        .filter_map(|(channel, secret)| secret.as_str().map(|s| (channel.clone(), s.to_string())))
        .collect();
    Ok(RemoteOperation {
        endpoint: endpoint.to_string(),
        operation_id: view.id,
        secrets,
    })
}
