// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Moving an instance between two daemons.
//!
//! The target creates a sink operation, the source is handed the sink's
//! secrets and pushes into it. The target's outcome decides the result: it is
//! the side that ends up holding the instance.

use crate::client::LodgeClient;
use crate::types::*;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub sink: OperationView,
    /// `None` when the source could not be observed to the end.
    pub source: Option<OperationView>,
}

impl MigrationOutcome {
    pub fn succeeded(&self) -> bool {
        self.sink.status == OperationStatus::Success
    }

    /// The most useful error text, preferring the target's.
    pub fn error(&self) -> Option<&str> {
        if self.succeeded() {
            return None;
        }
        let sink = self.sink.err.as_str();
        let source = self.source.as_ref().map(|v| v.err.as_str()).unwrap_or_default();
        Some(if sink.is_empty() { source } else { sink })
    }
}

pub async fn migrate(
    source: &LodgeClient,
    target: &LodgeClient,
    name: &str,
    idmap: IdmapConfig,
    live: bool,
) -> Result<MigrationOutcome> {
    let sink = target
        .migration_sink(name, &MigrationSinkRequest { idmap, live })
        .await?;
    info!(instance = name, operation_id = %sink.id, endpoint = target.base_url(), "Migration sink created");

    let request = MigrationSourceRequest {
        target: target.remote_operation(&sink)?,
        live,
    };
    let source_op = match source.migration_source(name, &request).await {
        Ok(op) => op,
        Err(e) => {
            if let Err(cancel) = target.cancel_operation(sink.id).await {
                warn!(operation_id = %sink.id, error = %cancel, "Failed to cancel migration sink");
            }
            return Err(e);
        }
    };
    info!(instance = name, operation_id = %source_op.id, endpoint = source.base_url(), "Migration source started");

    let (sink, pushed) = tokio::join!(
        target.wait_operation(sink.id, None),
        source.wait_operation(source_op.id, None)
    );
    let source = match pushed {
        Ok(view) => Some(view),
        Err(e) => {
            warn!(operation_id = %source_op.id, error = %e, "Lost track of migration source");
            None
        }
    };
    Ok(MigrationOutcome { sink: sink?, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished(status: &str, code: u16, err: &str) -> OperationView {
        serde_json::from_value(json!({
            "id": OperationId::new(),
            "class": "task",
            "description": "Migrating instance",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "status": status,
            "status_code": code,
            "may_cancel": false,
            "err": err,
        }))
        .unwrap()
    }

    #[test]
    fn test_target_outcome_is_authoritative() {
        let outcome = MigrationOutcome {
            sink: finished("Success", 200, ""),
            source: Some(finished("Failure", 400, "connection reset")),
        };
        assert!(outcome.succeeded());
        assert_eq!(outcome.error(), None);

        let outcome = MigrationOutcome {
            sink: finished("Failure", 400, ""),
            source: Some(finished("Failure", 400, "disk on fire")),
        };
        assert!(!outcome.succeeded());
        assert_eq!(outcome.error(), Some("disk on fire"));
    }
}
