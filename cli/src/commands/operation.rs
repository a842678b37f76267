// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operation commands
//!
//! Commands: list, show, wait, cancel

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::time::Duration;

use lodge_sdk::{LodgeClient, OperationId, OperationStatus, OperationView};

use super::format_operation_status;

#[derive(Subcommand)]
pub enum OperationCommand {
    /// List operations known to the daemon
    List,

    /// Show one operation
    Show {
        #[arg(value_name = "OPERATION_ID")]
        id: OperationId,
    },

    /// Block until an operation finishes
    Wait {
        #[arg(value_name = "OPERATION_ID")]
        id: OperationId,

        /// Give up after this many seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Cancel a pending or running operation
    Cancel {
        #[arg(value_name = "OPERATION_ID")]
        id: OperationId,
    },
}

pub async fn handle_command(command: OperationCommand, endpoint: &str) -> Result<()> {
    let client = LodgeClient::new(endpoint);
    match command {
        OperationCommand::List => list(&client).await,
        OperationCommand::Show { id } => {
            let view = client.get_operation(id).await.context("Failed to get operation")?;
            print_operation(&view);
            Ok(())
        }
        OperationCommand::Wait { id, timeout } => wait(&client, id, timeout).await,
        OperationCommand::Cancel { id } => {
            let view = client.cancel_operation(id).await.context("Failed to cancel operation")?;
            println!("{}", format!("✓ Operation {} {}", id, view.status.to_string().to_lowercase()).green());
            Ok(())
        }
    }
}

async fn list(client: &LodgeClient) -> Result<()> {
    let mut operations = client.list_operations().await.context("Failed to list operations")?;

    if operations.is_empty() {
        println!("{}", "No operations found".yellow());
        return Ok(());
    }

    operations.sort_by_key(|op| op.created_at);
    println!("{} operations:", operations.len());
    for op in operations {
        println!(
            "  {} - {} - {} - {}",
            op.id,
            op.class,
            op.description,
            format_operation_status(op.status)
        );
    }

    Ok(())
}

async fn wait(client: &LodgeClient, id: OperationId, timeout: Option<u64>) -> Result<()> {
    let view = client
        .wait_operation(id, timeout.map(Duration::from_secs))
        .await
        .context("Failed to wait for operation")?;
    print_operation(&view);
    if view.status == OperationStatus::Failure {
        anyhow::bail!("Operation {} failed: {}", id, view.err);
    }
    Ok(())
}

pub(crate) fn print_operation(view: &OperationView) {
    println!("Operation {}", view.id);
    println!("  Class: {}", view.class);
    println!("  Description: {}", view.description);
    println!(
        "  Status: {} ({})",
        format_operation_status(view.status),
        view.status_code
    );
    println!("  Created: {}", view.created_at);
    println!("  Updated: {}", view.updated_at);
    for (kind, urls) in &view.resources {
        println!("  {}: {}", kind, urls.join(", "));
    }
    if !view.metadata.is_empty() {
        if let Ok(metadata) = serde_json::to_string(&view.metadata) {
            println!("  Metadata: {}", metadata.dimmed());
        }
    }
    if !view.err.is_empty() {
        println!("  Error: {}", view.err.red());
    }
}
