//! Session credentials resolution.
//!
//! The bridge must never prompt for a password once it has logged in. The
//! access token and device id of the first login are handed to user-provided
//! "store" commands and read back through "read" commands on every start:
//!
//! ```text
//! read token ──► empty? ──no──► read device id ──► restore session
//!                  │
//!                 yes
//!                  ▼
//!           read password ──► login ──► store device id, store token
//! ```
//!
//! Where those values end up (a file, the system keyring, a password
//! manager...) is decided by the commands only.

use anyhow::{Context, bail};
use log::{debug, info, warn};

use crate::{
    matrix::{Authenticator, LoginTokens},
    shell::CommandRunner,
};

/// An established Matrix session, immutable for the process lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Homeserver host, without scheme
    pub homeserver: String,
    /// Fully qualified user id
    pub user_id: String,
    pub device_id: String,
    pub access_token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("homeserver", &self.homeserver)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// External commands used to obtain and cache credentials.
///
/// Every command is run through `sh -c`. Read commands print the value on
/// standard output, store commands receive it on standard input.
#[derive(Debug, Clone, Default)]
pub struct CredentialCommands {
    /// Prints the account password, only run when nothing is cached
    pub pass_command: Option<String>,
    pub token_command: Option<String>,
    pub store_token_command: Option<String>,
    pub device_command: Option<String>,
    pub store_device_command: Option<String>,
}

/// Resolves the session, resuming the cached one or logging in.
///
/// # Arguments
///
/// * `runner` - Runs the credential commands
/// * `auth` - Protocol client used to restore or log in
/// * `homeserver` - Homeserver host
/// * `user_id` - Fully qualified user id
/// * `commands` - Configured credential commands
/// * `device_name` - Device display name used for a fresh login
///
/// # Errors
///
/// Any failing command, a cached token without a device id, a missing password
/// command on cache miss or a rejected login are fatal. Nothing is retried.
pub async fn resolve_session<R, A>(
    runner: &R,
    auth: &A,
    homeserver: &str,
    user_id: &str,
    commands: &CredentialCommands,
    device_name: &str,
) -> anyhow::Result<Session>
where
    R: CommandRunner + ?Sized,
    A: Authenticator + ?Sized,
{
    let access_token = read_cached(runner, commands.token_command.as_deref())
        .await
        .context("failed to read cached access token")?;

    if !access_token.is_empty() {
        debug!("found cached access token");

        let device_id = read_cached(runner, commands.device_command.as_deref())
            .await
            .context("failed to read cached device id")?;
        if device_id.is_empty() {
            bail!("an access token is cached but no device id is");
        }

        let session = Session {
            homeserver: homeserver.to_owned(),
            user_id: user_id.to_owned(),
            device_id,
            access_token,
        };
        auth.restore(&session)
            .await
            .context("failed to restore cached session")?;

        return Ok(session);
    }

    info!("no cached session, logging in with password");

    let Some(pass_command) = commands.pass_command.as_deref() else {
        bail!("no cached session and no password command configured");
    };
    let password = runner
        .read(pass_command)
        .await
        .context("failed to read password")?;

    let LoginTokens {
        device_id,
        access_token,
    } = auth
        .login(&password, device_name)
        .await
        .context("login rejected")?;

    store_cached(runner, commands.store_device_command.as_deref(), &device_id)
        .await
        .context("failed to store device id")?;
    store_cached(runner, commands.store_token_command.as_deref(), &access_token)
        .await
        .context("failed to store access token")?;

    Ok(Session {
        homeserver: homeserver.to_owned(),
        user_id: user_id.to_owned(),
        device_id,
        access_token,
    })
}

/// Runs a read command, an unconfigured command reads as empty.
async fn read_cached<R: CommandRunner + ?Sized>(
    runner: &R,
    command: Option<&str>,
) -> anyhow::Result<String> {
    match command {
        Some(command) => Ok(runner.read(command).await?),
        None => Ok(String::new()),
    }
}

/// Runs a store command, an unconfigured command is skipped.
async fn store_cached<R: CommandRunner + ?Sized>(
    runner: &R,
    command: Option<&str>,
    value: &str,
) -> anyhow::Result<()> {
    match command {
        Some(command) => Ok(runner.store(command, value).await?),
        None => {
            warn!("no store command configured, the next start will log in again");
            Ok(())
        }
    }
}
