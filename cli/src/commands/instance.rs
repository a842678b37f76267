// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Instance management commands
//!
//! Commands: list, show, create, delete, start, stop

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use lodge_sdk::{CreateInstanceRequest, IdmapConfig, Instance, LodgeClient};

use super::format_instance_status;

#[derive(Subcommand)]
pub enum InstanceCommand {
    /// List instances
    List,

    /// Show one instance, including its idmap state
    Show {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Create an empty stopped instance
    Create {
        #[arg(value_name = "NAME")]
        name: String,

        #[command(flatten)]
        idmap: IdmapArgs,
    },

    /// Delete a stopped instance and its files
    Delete {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Start an instance, remapping its files first if needed
    Start {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Stop a running instance
    Stop {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

/// Idmap settings accepted by `create` and `move`.
#[derive(Args, Debug, Clone, Default)]
pub struct IdmapArgs {
    /// Reserve a private host id range
    #[arg(long)]
    pub isolated: bool,

    /// Size of the isolated range
    #[arg(long, value_name = "IDS", requires = "isolated")]
    pub idmap_size: Option<i64>,

    /// Fixed host base for the isolated range
    #[arg(long, value_name = "ID", requires = "isolated")]
    pub idmap_base: Option<i64>,

    /// Raw idmap entries ("uid 1000 1000"), or @file to read them
    #[arg(long, value_name = "ENTRIES")]
    pub raw_idmap: Option<String>,
}

impl IdmapArgs {
    pub fn into_config(self) -> Result<IdmapConfig> {
        let raw = match self.raw_idmap {
            Some(value) => match value.strip_prefix('@') {
                Some(path) => {
                    let path = PathBuf::from(path);
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read raw idmap from {:?}", path))?
                }
                None => value,
            },
            None => String::new(),
        };
        Ok(IdmapConfig {
            isolated: self.isolated,
            size: self.idmap_size,
            base: self.idmap_base,
            raw,
        })
    }
}

pub async fn handle_command(command: InstanceCommand, endpoint: &str) -> Result<()> {
    let client = LodgeClient::new(endpoint);
    match command {
        InstanceCommand::List => list(&client).await,
        InstanceCommand::Show { name } => show(&client, &name).await,
        InstanceCommand::Create { name, idmap } => create(&client, name, idmap).await,
        InstanceCommand::Delete { name } => delete(&client, &name).await,
        InstanceCommand::Start { name } => start(&client, &name).await,
        InstanceCommand::Stop { name } => stop(&client, &name).await,
    }
}

async fn list(client: &LodgeClient) -> Result<()> {
    let instances = client.list_instances().await.context("Failed to list instances")?;

    if instances.is_empty() {
        println!("{}", "No instances found".yellow());
        return Ok(());
    }

    println!("{} instances:", instances.len());
    for instance in instances {
        let idmap = if instance.idmap.isolated { "isolated" } else { "shared" };
        println!(
            "  {} - {} - {}",
            instance.name.bold(),
            format_instance_status(instance.status),
            idmap
        );
    }

    Ok(())
}

async fn show(client: &LodgeClient, name: &str) -> Result<()> {
    let instance = client
        .get_instance(name)
        .await
        .with_context(|| format!("Failed to get instance {}", name))?;
    print_instance(&instance);
    Ok(())
}

async fn create(client: &LodgeClient, name: String, idmap: IdmapArgs) -> Result<()> {
    let request = CreateInstanceRequest {
        name,
        idmap: idmap.into_config()?,
    };
    let instance = client
        .create_instance(&request)
        .await
        .with_context(|| format!("Failed to create instance {}", request.name))?;
    println!("{}", format!("✓ Instance created: {}", instance.name).green());
    print_instance(&instance);
    Ok(())
}

async fn delete(client: &LodgeClient, name: &str) -> Result<()> {
    client
        .delete_instance(name)
        .await
        .with_context(|| format!("Failed to delete instance {}", name))?;
    println!("{}", format!("✓ Instance {} deleted", name).green());
    Ok(())
}

async fn start(client: &LodgeClient, name: &str) -> Result<()> {
    let instance = client
        .start_instance(name)
        .await
        .with_context(|| format!("Failed to start instance {}", name))?;
    println!("{}", format!("✓ Instance {} started", instance.name).green());
    Ok(())
}

async fn stop(client: &LodgeClient, name: &str) -> Result<()> {
    let instance = client
        .stop_instance(name)
        .await
        .with_context(|| format!("Failed to stop instance {}", name))?;
    println!("{}", format!("✓ Instance {} stopped", instance.name).green());
    Ok(())
}

fn print_instance(instance: &Instance) {
    println!("Instance {}", instance.name.bold());
    println!("  Status: {}", format_instance_status(instance.status));
    println!("  Path: {}", instance.root_path.display());
    println!("  Created: {}", instance.created_at);
    if let Some(base) = instance.volatile.base {
        println!("  Isolated base: {}", base);
    }
    println!("  Next idmap:");
    for line in instance.volatile.next.to_lxc_strings() {
        println!("    {}", line);
    }
    if instance.remap_pending() {
        println!("  {}", "Files need remapping before the next start".yellow());
        for line in instance.volatile.last_state.to_lxc_strings() {
            println!("    {}", line.dimmed());
        }
    }
}
