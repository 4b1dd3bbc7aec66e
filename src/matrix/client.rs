//! Matrix client wrapper for the bridge.
//!
//! This module provides a high-level [`MatrixClient`] interface that wraps the
//! Matrix SDK client and exposes synchronization, room discovery and plain-text
//! sending. The client is cheap to share: the SDK client is internally
//! reference counted and safe to use from many tasks at once, so relays and the
//! sync loop all go through one `Arc<MatrixClient>`.

use std::{path::Path, time::Duration};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info};
use matrix_sdk::{
    Client, LoopCtrl,
    config::SyncSettings,
    ruma::{OwnedUserId, RoomId, UserId, events::room::message::RoomMessageEventContent},
};
use tokio_util::sync::CancellationToken;

use crate::{
    matrix::{MirroredMessage, Room, sync},
    relay::MessageSender,
};

/// High-level Matrix client for the bridge.
pub struct MatrixClient {
    /// Underlying Matrix SDK client
    client: Client,
    /// Fully qualified id of the bridged account
    user_id: OwnedUserId,
}

impl MatrixClient {
    /// Creates a client for `homeserver`, not yet authenticated.
    ///
    /// # Arguments
    ///
    /// * `homeserver` - Homeserver host, reached over `https`
    /// * `user_id` - Fully qualified user id of the account
    /// * `store_path` - Optional directory for the SDK sqlite state store. With a
    ///   store, room state and the sync token survive restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if the user id is invalid or the client cannot be built.
    pub async fn new(
        homeserver: &str,
        user_id: &str,
        store_path: Option<&Path>,
    ) -> Result<Self, anyhow::Error> {
        let user_id = UserId::parse(user_id).with_context(|| format!("invalid user id {user_id}"))?;

        let mut builder = Client::builder().homeserver_url(format!("https://{homeserver}"));
        if let Some(store_path) = store_path {
            debug!("using state store at {}", store_path.display());
            builder = builder.sqlite_store(store_path, None);
        }

        let client = builder.build().await.context("failed to build matrix client")?;
        debug!("matrix client created for {}", homeserver);

        Ok(MatrixClient { client, user_id })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub(crate) fn sdk_client(&self) -> &Client {
        &self.client
    }

    /// Performs a single sync and returns the next batch token.
    ///
    /// Used once at startup, with a short timeout, to learn which rooms the
    /// account is in. Event handlers already registered are dispatched as usual.
    pub async fn sync_once(&self, timeout: Duration) -> Result<String, anyhow::Error> {
        let response = self
            .client
            .sync_once(SyncSettings::default().timeout(timeout))
            .await
            .context("initial sync failed")?;

        Ok(response.next_batch)
    }

    /// Long-polls the homeserver until an error occurs or `cancel` fires.
    ///
    /// # Arguments
    ///
    /// * `since` - Token returned by [`Self::sync_once`]
    /// * `timeout` - Long-poll timeout of each request
    /// * `cancel` - Stops the loop after the current request returns
    ///
    /// # Errors
    ///
    /// Any sync failure ends the loop and is returned, there is no reconnect.
    pub async fn sync_forever(
        &self,
        since: String,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        info!("start syncing");

        let sync_settings = SyncSettings::default().timeout(timeout).token(since);

        self.client
            .sync_with_result_callback(sync_settings, |sync_result| {
                let cancel = cancel.clone();
                async move {
                    sync_result?;
                    if cancel.is_cancelled() {
                        return Ok(LoopCtrl::Break);
                    }
                    Ok(LoopCtrl::Continue)
                }
            })
            .await?;

        info!("matrix sync ended");
        Ok(())
    }

    /// Returns the joined rooms with their current display names.
    pub async fn joined_rooms(&self) -> Vec<Room> {
        join_all(self.client.joined_rooms().iter().map(sync::to_room)).await
    }

    /// Subscribes `on_message` to every text message of a joined room.
    ///
    /// The returned future is awaited before the next event is dispatched, so
    /// messages are handled one at a time in the order the sync delivers them.
    pub fn on_text_message<F, Fut>(&self, on_message: F)
    where
        F: Fn(Room, MirroredMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        sync::register_message_handler(&self.client, on_message);
    }

    /// Accepts invites automatically, `on_joined` is called once a room is joined.
    pub fn auto_join<F>(&self, on_joined: F)
    where
        F: Fn(Room) + Send + Sync + 'static,
    {
        sync::register_auto_join(&self.client, on_joined);
    }
}

#[async_trait]
impl MessageSender for MatrixClient {
    /// Sends `text` as a plain `m.text` message.
    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), anyhow::Error> {
        let room_id = RoomId::parse(room_id)?;
        let room = self
            .client
            .get_room(&room_id)
            .ok_or_else(|| anyhow!("room {} is not known", room_id))?;

        room.send(RoomMessageEventContent::text_plain(text)).await?;
        debug!("sent message to {}", room_id);

        Ok(())
    }
}
