//! Event handlers registered on the SDK client.
//!
//! Only two kinds of events matter to the bridge:
//! - text messages in joined rooms, forwarded to the mirror callback
//! - invites for the bridged account, accepted when auto-join is enabled

use std::sync::Arc;

use log::{error, info, warn};
use matrix_sdk::{
    Client, RoomState,
    ruma::events::room::{
        member::StrippedRoomMemberEvent,
        message::{MessageType, OriginalSyncRoomMessageEvent},
    },
};
use tokio::time::{Duration, sleep};

use crate::matrix::{MirroredMessage, Room};

/// Joining is given up once the retry delay grows past this many seconds.
const MAX_JOIN_DELAY_SECS: u64 = 3600;

/// Snapshots an SDK room into a [`Room`].
///
/// Falls back to the room id when the display name cannot be computed.
pub(crate) async fn to_room(room: &matrix_sdk::Room) -> Room {
    let display_name = match room.display_name().await {
        Ok(name) => name.to_string(),
        Err(e) => {
            warn!("failed to compute display name of {}: {:?}", room.room_id(), e);
            room.room_id().to_string()
        }
    };

    Room {
        room_id: room.room_id().to_string(),
        display_name,
    }
}

/// Registers `on_message` for text messages in joined rooms.
pub(crate) fn register_message_handler<F, Fut>(client: &Client, on_message: F)
where
    F: Fn(Room, MirroredMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let on_message = Arc::new(on_message);

    client.add_event_handler(
        move |event: OriginalSyncRoomMessageEvent, room: matrix_sdk::Room| {
            let on_message = Arc::clone(&on_message);
            async move { on_room_message(event, room, &on_message).await }
        },
    );
}

/// Registers the auto-join handler, `on_joined` runs after each successful join.
pub(crate) fn register_auto_join<F>(client: &Client, on_joined: F)
where
    F: Fn(Room) + Send + Sync + 'static,
{
    let on_joined = Arc::new(on_joined);

    client.add_event_handler(
        move |room_member: StrippedRoomMemberEvent, client: Client, room: matrix_sdk::Room| {
            let on_joined = Arc::clone(&on_joined);
            async move { auto_join_room(room_member, client, room, on_joined).await }
        },
    );
}

/// Joins the room when the invite is for the bridged account.
///
/// See <https://github.com/matrix-org/synapse/issues/4345> for why joining
/// right after the invite may fail and must be retried.
async fn auto_join_room<F>(
    room_member: StrippedRoomMemberEvent,
    client: Client,
    room: matrix_sdk::Room,
    on_joined: Arc<F>,
) where
    F: Fn(Room) + Send + Sync + 'static,
{
    let Some(user_id) = client.user_id() else {
        warn!("could not get user id from client");
        return;
    };

    // Ignore if the invite is not for us
    if room_member.state_key != user_id {
        return;
    }

    tokio::spawn(async move {
        info!("auto joining room {}", room.room_id());
        let mut delay = 2;

        while let Err(err) = room.join().await {
            error!(
                "failed to join room {} ({err:?}), retrying in {delay}s",
                room.room_id()
            );

            sleep(Duration::from_secs(delay)).await;
            delay *= 2;

            if delay > MAX_JOIN_DELAY_SECS {
                error!("can't join room {} ({err:?})", room.room_id());
                return;
            }
        }

        info!("successfully joined room {}", room.room_id());
        on_joined(to_room(&room).await);
    });
}

/// Forwards a text message of a joined room to the callback.
///
/// Non-text messages (images, files, edits, ...) are ignored.
async fn on_room_message<F, Fut>(
    event: OriginalSyncRoomMessageEvent,
    room: matrix_sdk::Room,
    on_message: &Arc<F>,
) where
    F: Fn(Room, MirroredMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // Ignore messages from non-joined rooms
    if room.state() != RoomState::Joined {
        return;
    }

    let MessageType::Text(text_content) = event.content.msgtype else {
        return;
    };

    let message = MirroredMessage {
        room_id: room.room_id().to_string(),
        sender: event.sender.to_string(),
        event_id: event.event_id.to_string(),
        body: text_content.body,
        server_timestamp_ms: u64::from(event.origin_server_ts.0),
    };

    on_message(to_room(&room).await, message).await;
}
