//! mpmc - A Matrix to filesystem bridge.
//!
//! mpmc logs into one Matrix account and exposes it as a directory tree:
//! incoming text messages become files, and writing a line to a room's named
//! pipe sends it to the room.
//!
//! # Mailbox Tree
//!
//! ```text
//! <directory>/<homeserver>/<user>/
//! └── <room id>/
//!     ├── name                       current display name of the room
//!     ├── in                         FIFO, each line is sent to the room
//!     └── <sender>/
//!         └── <event id>:<homeserver> message body, mtime = server timestamp
//! ```
//!
//! Every message is written once. The path of each new message file is printed
//! on stdout, one per line, for downstream tools to pick up.
//!
//! # Credentials
//!
//! No secret is stored by mpmc. The password, access token and device id are
//! read from, and cached through, user-provided shell commands (see
//! [`config`]). The password command only runs when no session is cached.
//!
//! # Usage
//!
//! ```bash
//! mpmc -s example.org -u alice -p "pass show matrix/alice" \
//!     --token-command "cat ~/.cache/mpmc/token" \
//!     --store-token-command "cat > ~/.cache/mpmc/token" \
//!     --device-command "cat ~/.cache/mpmc/device" \
//!     --store-device-command "cat > ~/.cache/mpmc/device"
//! ```
//!
//! # Architecture
//!
//! - [`bridge`] - Lifecycle, room discovery and task supervision
//! - [`config`] - Layered configuration (defaults, YAML, environment, flags)
//! - [`matrix`] - Matrix client, session resolution and event subscription
//! - [`mirror`] - Deduplicated writes into the mailbox tree
//! - [`relay`] - Per-room FIFOs relayed into rooms
//! - [`shell`] - Execution of the credential commands
//! - [`utils`] - Identifier and path helpers
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `info`). Logs go to stderr.
//! - `MPMC_*` - Overrides any configuration value, e.g. `MPMC_HOMESERVER`
#![recursion_limit = "256"]

use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use log::{error, info};
use serde::Serialize;

use crate::{bridge::Bridge, config::Config};

mod bridge;
mod config;
mod matrix;
mod mirror;
mod relay;
mod shell;
mod utils;

/// Command-line arguments, each one overriding the configuration file and
/// the environment.
#[derive(Parser, Serialize, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to an optional YAML configuration file
    #[arg(short, long)]
    #[serde(skip)]
    config: Option<PathBuf>,

    /// Account localpart or full user id (default: $USER)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,

    /// Homeserver host, e.g. matrix.org
    #[arg(short = 's', long = "server")]
    #[serde(rename = "homeserver", skip_serializing_if = "Option::is_none")]
    server: Option<String>,

    /// Root of the mailbox tree (default: $XDG_DATA_HOME/mpmc)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    directory: Option<PathBuf>,

    /// Display name of the device registered at login
    #[arg(short = 'n', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,

    /// Command printing the account password
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pass_command: Option<String>,

    /// Command printing the cached access token
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    token_command: Option<String>,

    /// Command storing the access token read from stdin
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    store_token_command: Option<String>,

    /// Command printing the cached device id
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    device_command: Option<String>,

    /// Command storing the device id read from stdin
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    store_device_command: Option<String>,

    /// Long-poll timeout of each sync request, in milliseconds
    #[arg(long = "sync-timeout")]
    #[serde(rename = "sync_timeout_ms", skip_serializing_if = "Option::is_none")]
    sync_timeout: Option<u64>,

    /// Directory of the persistent Matrix state store
    #[arg(long = "store")]
    #[serde(rename = "store_path", skip_serializing_if = "Option::is_none")]
    store: Option<PathBuf>,

    /// Accept room invites automatically
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    auto_join: bool,
}

fn is_false(value: &bool) -> bool {
    !value
}

#[tokio::main]
async fn main() {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    info!("Starting mpmc {}...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref(), &args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let bridge = match Bridge::new(config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("Failed to start bridge: {:#}", e);
            std::process::exit(1);
        }
    };

    let code = match bridge.run().await {
        Ok(reason) => reason.exit_code(),
        Err(e) => {
            error!("Bridge failed: {:#}", e);
            1
        }
    };

    // Relay threads may still be blocked on their FIFO
    std::process::exit(code);
}
