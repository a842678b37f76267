// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the Lodge CLI

pub mod config;
pub mod exec;
pub mod instance;
pub mod migrate;
pub mod netcat;
pub mod operation;

pub use self::config::ConfigCommand;
pub use self::exec::ExecArgs;
pub use self::instance::InstanceCommand;
pub use self::migrate::MoveArgs;
pub use self::operation::OperationCommand;

use colored::{ColoredString, Colorize};
use lodge_sdk::{InstanceStatus, OperationStatus};

pub const DEFAULT_PORT: u16 = 8443;

/// Base URL of a daemon given on the command line.
pub fn endpoint(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

pub(crate) fn format_operation_status(status: OperationStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        OperationStatus::Success => text.green(),
        OperationStatus::Failure => text.red(),
        OperationStatus::Cancelled | OperationStatus::Cancelling => text.yellow(),
        OperationStatus::Pending | OperationStatus::Running => text.cyan(),
    }
}

pub(crate) fn format_instance_status(status: InstanceStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        InstanceStatus::Running => text.green(),
        InstanceStatus::Stopped => text.normal(),
        InstanceStatus::Migrating => text.yellow(),
    }
}
