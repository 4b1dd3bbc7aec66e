//! Matrix protocol integration for the bridge.
//!
//! This module wraps the Matrix SDK behind the few operations the bridge needs:
//! - Password login and session resumption from cached credentials
//! - One-shot and continuous synchronization
//! - Plain-text message sending
//! - A typed subscription delivering incoming text messages
//!
//! # Architecture
//!
//! - [`client::MatrixClient`] owns the SDK client and exposes the operations above
//! - [`session`] resolves the [`Session`] through the external credential commands
//! - `auth` performs login and restore against the homeserver
//! - `sync` registers the event handlers used during synchronization

mod auth;
mod client;
pub mod session;
mod sync;

pub use crate::matrix::auth::{Authenticator, LoginTokens};
pub use crate::matrix::client::MatrixClient;
pub use crate::matrix::session::{CredentialCommands, Session, resolve_session};

/// A room known to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// Stable room id, e.g. `!abc:example.org`
    pub room_id: String,
    /// Current display name, refreshed on every incoming message
    pub display_name: String,
}

/// An incoming text message, as mirrored into the mailbox tree.
///
/// Uniquely identified by `(room_id, sender, event_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredMessage {
    pub room_id: String,
    pub sender: String,
    pub event_id: String,
    /// Message body, byte for byte as received
    pub body: String,
    /// Server timestamp in milliseconds since the unix epoch
    pub server_timestamp_ms: u64,
}
