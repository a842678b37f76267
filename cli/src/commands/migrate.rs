// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `lodge move`: migrate an instance from the daemon at `--host`/`--port` to
//! another daemon.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use lodge_sdk::{migrate, LodgeClient};

use super::instance::IdmapArgs;
use super::operation::print_operation;

#[derive(Args, Debug)]
pub struct MoveArgs {
    #[arg(value_name = "INSTANCE")]
    pub instance: String,

    /// Base URL of the receiving daemon, e.g. http://10.0.0.2:8443
    #[arg(long, value_name = "URL")]
    pub target: String,

    /// Also transfer the runtime state of a running instance
    #[arg(long)]
    pub live: bool,

    /// Delete the source copy once the target has it
    #[arg(long)]
    pub remove_source: bool,

    /// Idmap for the instance on the target
    #[command(flatten)]
    pub idmap: IdmapArgs,
}

pub async fn run(args: MoveArgs, endpoint: &str) -> Result<()> {
    let source = LodgeClient::new(endpoint);
    let target = LodgeClient::new(args.target.as_str());

    println!(
        "Moving {} from {} to {}...",
        args.instance.bold(),
        source.base_url(),
        target.base_url()
    );

    let outcome = migrate(&source, &target, &args.instance, args.idmap.into_config()?, args.live)
        .await
        .with_context(|| format!("Failed to move instance {}", args.instance))?;

    if !outcome.succeeded() {
        print_operation(&outcome.sink);
        if let Some(view) = &outcome.source {
            print_operation(view);
        }
        anyhow::bail!(
            "Migration of {} failed: {}",
            args.instance,
            outcome.error().unwrap_or_default()
        );
    }

    println!("{}", format!("✓ Instance {} moved to {}", args.instance, target.base_url()).green());

    if args.remove_source {
        source
            .delete_instance(&args.instance)
            .await
            .with_context(|| format!("Instance moved but the source copy of {} was not deleted", args.instance))?;
        println!("{}", format!("✓ Source copy of {} deleted", args.instance).green());
    }

    Ok(())
}
