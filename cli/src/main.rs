// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Lodge CLI
//!
//! The `lodge` binary runs the host daemon and drives daemons over their
//! REST API.
//!
//! - **Daemon mode**: `lodge --daemon` serves the API in the foreground
//! - **Client mode**: every other command talks to `--host`/`--port`
//!
//! ## Commands
//!
//! - `lodge instance list|show|create|delete|start|stop` - Instance management
//! - `lodge operation list|show|wait|cancel` - Background operations
//! - `lodge exec <instance> -- <command>` - Run a command inside an instance
//! - `lodge move <instance> --target <url>` - Migrate an instance to another host
//! - `lodge status` - Daemon health
//! - `lodge config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use lodge::commands::{self, ConfigCommand, ExecArgs, InstanceCommand, MoveArgs, OperationCommand};
use lodge::daemon::{self, DaemonStatus};

/// Lodge - system container host daemon
#[derive(Parser)]
#[command(name = "lodge")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Run the daemon in the foreground
    #[arg(long, global = true)]
    daemon: bool,

    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "LODGE_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Daemon API port; in daemon mode overrides the configured port
    #[arg(long, global = true, env = "LODGE_PORT")]
    port: Option<u16>,

    /// Daemon API host (default: 127.0.0.1)
    #[arg(long, global = true, env = "LODGE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LODGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage instances
    #[command(name = "instance")]
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },

    /// Inspect and control background operations
    #[command(name = "operation")]
    Operation {
        #[command(subcommand)]
        command: OperationCommand,
    },

    /// Run a command inside a running instance
    #[command(name = "exec")]
    Exec(ExecArgs),

    /// Move an instance to another daemon
    #[command(name = "move")]
    Move(MoveArgs),

    /// Check whether the daemon answers
    #[command(name = "status")]
    Status,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Copy stdio to a unix socket (used as the rsync remote shell)
    #[command(name = "netcat", hide = true)]
    Netcat {
        #[arg(value_name = "SOCKET")]
        socket: PathBuf,

        /// Host and remote command appended by rsync; ignored
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
        rest: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netcat_accepts_rsync_remote_command() {
        let cli = Cli::try_parse_from([
            "lodge", "netcat", "/tmp/x.sock", "lodge", "rsync", "--server", "-vlogDtpre.iLsfxC", ".", "/srv",
        ])
        .unwrap();
        let Some(Commands::Netcat { socket, rest }) = cli.command else {
            panic!("expected netcat");
        };
        assert_eq!(socket, PathBuf::from("/tmp/x.sock"));
        assert_eq!(rest[1], "rsync");
    }

    #[test]
    fn test_daemon_flag_and_port() {
        let cli = Cli::try_parse_from(["lodge", "--daemon", "--port", "9443"]).unwrap();
        assert!(cli.daemon);
        assert_eq!(cli.port, Some(9443));
        assert!(cli.command.is_none());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // netcat owns stdout; rsync would read log lines as protocol data
    if let Some(Commands::Netcat { socket, .. }) = &cli.command {
        return commands::netcat::run(socket).await;
    }

    init_logging(&cli.log_level)?;

    if cli.daemon {
        info!("Starting Lodge in daemon mode");
        return daemon::start_daemon(cli.config, cli.port).await;
    }

    let endpoint = commands::endpoint(&cli.host, cli.port.unwrap_or(commands::DEFAULT_PORT));
    match cli.command {
        Some(Commands::Instance { command }) => commands::instance::handle_command(command, &endpoint).await,
        Some(Commands::Operation { command }) => commands::operation::handle_command(command, &endpoint).await,
        Some(Commands::Exec(args)) => {
            let code = commands::exec::run(args, &endpoint).await?;
            std::process::exit(code);
        }
        Some(Commands::Move(args)) => commands::migrate::run(args, &endpoint).await,
        Some(Commands::Status) => status(&endpoint).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Netcat { .. }) => Ok(()),
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

async fn status(endpoint: &str) -> Result<()> {
    match daemon::check_daemon_running(endpoint).await? {
        DaemonStatus::Running { pid, uptime } => {
            println!("{}", format!("✓ Daemon running at {}", endpoint).green());
            if let Some(pid) = pid {
                println!("  PID: {}", pid);
            }
            if let Some(uptime) = uptime {
                println!("  Uptime: {}s", uptime);
            }
        }
        DaemonStatus::Unhealthy { pid, error } => {
            println!("{}", format!("✗ Daemon unhealthy: {}", error).red());
            if let Some(pid) = pid {
                println!("  PID: {}", pid);
            }
        }
        DaemonStatus::Stopped => {
            println!("{}", format!("Daemon not running at {}", endpoint).yellow());
        }
    }
    Ok(())
}

/// `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
