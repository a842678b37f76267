// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use lodge_core::domain::node_config::DaemonConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path (default: ./lodge-config.yaml)
        #[arg(short, long, default_value = "./lodge-config.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output } => generate(output),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = DaemonConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. LODGE_CONFIG_PATH: {}",
            std::env::var("LODGE_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./lodge-config.yaml");
        println!("  4. ~/.lodge/config.yaml");
        println!("  5. /etc/lodge/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();
    let spec = &config.spec;
    println!("{}", "Host:".bold());
    println!("  Name: {}", config.metadata.name);
    println!("  Listen: {}:{}", spec.server.bind_address, spec.server.port);
    println!();

    println!("{}", "Operations:".bold());
    println!("  Retention: {}s", spec.operations.retention_secs);
    println!("  Pending timeout: {}s", spec.operations.pending_timeout_secs);
    match spec.operations.default_wait() {
        Some(wait) => println!("  Default wait: {}s", wait.as_secs()),
        None => println!("  Default wait: {}", "unbounded".dimmed()),
    }
    println!();

    println!("{}", "Migration:".bold());
    println!("  Connect timeout: {}s", spec.migration.connect_timeout_secs);
    println!("  Idle timeout: {}s", spec.migration.idle_timeout_secs);
    println!("  Rsync: {}", spec.migration.rsync_binary);
    if let Some(limit) = &spec.migration.bwlimit {
        println!("  Bandwidth limit: {} KiB/s", limit);
    }
    println!();

    println!("{}", "Idmap:".bold());
    println!("  User: {}", spec.idmap.username);
    println!("  subuid: {}", spec.idmap.subuid_path.display());
    println!("  subgid: {}", spec.idmap.subgid_path.display());
    println!();

    println!("{}", "Storage:".bold());
    println!("  Instances: {}", spec.storage.instances_dir.display());
    println!("  Backend: {}", spec.storage.backend);

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = DaemonConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf) -> Result<()> {
    DaemonConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
