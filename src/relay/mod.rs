//! Outbound relay: named pipes turned into room messages.
//!
//! Every known room gets a FIFO at `<room dir>/in`. Each line written to it is
//! sent to the room as a plain-text message:
//!
//! ```bash
//! echo "hello" > ~/.local/share/mpmc/example.org/alice/'!r:example.org'/in
//! ```
//!
//! Opening and reading a FIFO blocks, so each relay reads on its own OS thread
//! and hands lines to an async task that performs the sends in order.

mod conduit;
mod outbound;

use async_trait::async_trait;
use mockall::automock;

pub use crate::relay::conduit::create_conduit;
pub use crate::relay::outbound::{OutboundRelay, RelayHandle};

/// Sends plain-text messages into rooms.
///
/// Implemented by the Matrix client, must tolerate concurrent calls from every
/// relay and the sync loop.
#[automock]
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), anyhow::Error>;
}
