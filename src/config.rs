//! Configuration of the bridge.
//!
//! The configuration is layered with figment, later layers winning:
//!
//! 1. built-in defaults
//! 2. an optional YAML file (`--config`)
//! 3. environment variables prefixed with `MPMC_`
//! 4. command-line flags
//!
//! # Configuration File Format
//!
//! ```yaml
//! # Homeserver host, `https://` is optional
//! homeserver: "example.org"
//! user: "alice"
//! directory: "/home/alice/.local/share/mpmc"
//! device_name: "mpmc on laptop"
//!
//! # Credential commands, run with `sh -c`
//! pass_command: "pass show matrix/alice"
//! token_command: "cat ~/.cache/mpmc/token"
//! store_token_command: "cat > ~/.cache/mpmc/token"
//! device_command: "cat ~/.cache/mpmc/device"
//! store_device_command: "cat > ~/.cache/mpmc/device"
//!
//! sync_timeout_ms: 30000
//! auto_join: false
//! ```
//!
//! # Environment Variable Overrides
//!
//! ```bash
//! export MPMC_HOMESERVER="example.org"
//! export MPMC_PASS_COMMAND="pass show matrix/alice"
//! ```

use std::path::{Path, PathBuf};

use anyhow::bail;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{
    matrix::CredentialCommands,
    utils::{default_data_dir, normalize_homeserver, qualify_user_id},
};

/// Prefix of the environment variables read by the configuration.
pub const ENV_PREFIX: &str = "MPMC_";

/// Default long-poll timeout of the sync loop.
const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

/// Root configuration of the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Account name, a localpart (`alice`) or a full user id
    pub user: String,

    /// Homeserver host, e.g. `matrix.org`.
    ///
    /// Used both to reach the server over `https` and as a mailbox tree component.
    pub homeserver: String,

    /// Root of the mailbox tree
    pub directory: PathBuf,

    /// Display name of the device registered at login
    pub device_name: String,

    /// Prints the password, only run when no session is cached
    pub pass_command: Option<String>,
    /// Prints the cached access token
    pub token_command: Option<String>,
    /// Receives the access token to cache on stdin
    pub store_token_command: Option<String>,
    /// Prints the cached device id
    pub device_command: Option<String>,
    /// Receives the device id to cache on stdin
    pub store_device_command: Option<String>,

    /// Long-poll timeout of each sync request, in milliseconds
    pub sync_timeout_ms: u64,

    /// Directory of the SDK state store. Without it the state lives in memory
    /// and every start syncs from scratch.
    pub store_path: Option<PathBuf>,

    /// Accept room invites automatically
    pub auto_join: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            user: std::env::var("USER").unwrap_or_default(),
            homeserver: String::new(),
            directory: default_data_dir(),
            device_name: "mpmc".to_string(),
            pass_command: None,
            token_command: None,
            store_token_command: None,
            device_command: None,
            store_device_command: None,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            store_path: None,
            auto_join: false,
        }
    }
}

impl Config {
    /// Loads the configuration from every layer.
    ///
    /// # Arguments
    ///
    /// * `path` - Optional YAML configuration file
    /// * `overrides` - Values set on the command line, serialized fields win
    ///   over every other layer
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is invalid.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: &T) -> Result<Self, anyhow::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.exists() {
                bail!("configuration file {} does not exist", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }

        let mut config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        config.homeserver = normalize_homeserver(&config.homeserver);
        config.validate()?;

        Ok(config)
    }

    /// Checks the values no default can provide.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.homeserver.is_empty() {
            bail!("no homeserver configured");
        }
        if self.user.is_empty() {
            bail!("no user configured");
        }
        Ok(())
    }

    /// Fully qualified user id of the account.
    pub fn user_id(&self) -> String {
        qualify_user_id(&self.user, &self.homeserver)
    }

    pub fn credential_commands(&self) -> CredentialCommands {
        CredentialCommands {
            pass_command: self.pass_command.clone(),
            token_command: self.token_command.clone(),
            store_token_command: self.store_token_command.clone(),
            device_command: self.device_command.clone(),
            store_device_command: self.store_device_command.clone(),
        }
    }
}
