//! Authentication against the homeserver.
//!
//! Two ways to obtain an authenticated client:
//!
//! **Fresh login** (nothing cached): logs in with the user password and an
//! initial device display name. The homeserver hands back a new device id and
//! access token, which the caller persists through the credential commands.
//!
//! **Restore** (token cached): rebuilds the SDK session from the cached device
//! id and access token. No request is sent, the token is only checked by the
//! first sync.

use async_trait::async_trait;
use log::{debug, info};
use matrix_sdk::{
    SessionMeta, SessionTokens, authentication::matrix::MatrixSession, ruma::UserId,
};
use mockall::automock;

use crate::matrix::{MatrixClient, Session};

/// Credentials returned by a successful password login.
#[derive(Clone, PartialEq, Eq)]
pub struct LoginTokens {
    /// Device id assigned by the homeserver
    pub device_id: String,
    /// Long-lived access token for that device
    pub access_token: String,
}

impl std::fmt::Debug for LoginTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginTokens")
            .field("device_id", &self.device_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Operations of the protocol client used to establish a session.
#[automock]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Logs in with a password, registering a device named `device_name`.
    async fn login(&self, password: &str, device_name: &str) -> anyhow::Result<LoginTokens>;

    /// Resumes a previously established session without a password.
    async fn restore(&self, session: &Session) -> anyhow::Result<()>;
}

#[async_trait]
impl Authenticator for MatrixClient {
    async fn login(&self, password: &str, device_name: &str) -> anyhow::Result<LoginTokens> {
        info!("logging in as {}", self.user_id());

        let response = self
            .sdk_client()
            .matrix_auth()
            .login_username(self.user_id(), password)
            .initial_device_display_name(device_name)
            .send()
            .await?;

        info!("logged in with new device {}", response.device_id);

        Ok(LoginTokens {
            device_id: response.device_id.to_string(),
            access_token: response.access_token,
        })
    }

    async fn restore(&self, session: &Session) -> anyhow::Result<()> {
        info!(
            "restoring session for {} on device {}",
            session.user_id, session.device_id
        );

        let user_session = MatrixSession {
            meta: SessionMeta {
                user_id: UserId::parse(session.user_id.as_str())?,
                device_id: session.device_id.as_str().into(),
            },
            tokens: SessionTokens {
                access_token: session.access_token.clone(),
                refresh_token: None,
            },
        };

        self.sdk_client().restore_session(user_session).await?;

        debug!("session restored");
        Ok(())
    }
}
