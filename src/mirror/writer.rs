//! Idempotent writes of incoming messages into the mailbox tree.

use std::{
    fs::FileTimes,
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, error, trace, warn};
use thiserror::Error;
use tokio::{
    fs::{self, DirBuilder, File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{
    matrix::{MirroredMessage, Room},
    mirror::MailboxTree,
};

/// Permissions of every directory of the mailbox tree.
pub const DIR_MODE: u32 = 0o700;

/// Errors raised while mirroring one message.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// An id would escape its directory once used as a path component.
    #[error("`{0}` cannot be used as a file name")]
    UnsafeComponent(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of mirroring one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The message file was created.
    Written(PathBuf),
    /// The message file already existed and was left untouched.
    Duplicate(PathBuf),
}

/// Writes incoming messages into the mailbox tree, each exactly once.
///
/// The existence of the message file is the deduplication key: an event
/// delivered again (after a restart, a resumed sync...) is a no-op. Only one
/// bridge per account may write into a given tree.
#[derive(Debug, Clone)]
pub struct MirrorWriter {
    tree: MailboxTree,
}

impl MirrorWriter {
    pub fn new(tree: MailboxTree) -> Self {
        MirrorWriter { tree }
    }

    pub fn tree(&self) -> &MailboxTree {
        &self.tree
    }

    /// Mirrors `message`, logging and dropping any failure.
    ///
    /// # Returns
    ///
    /// The path of the message file when it was newly written, `None` for a
    /// duplicate or a failure. Callers notify downstream tools with this path.
    pub async fn on_message(&self, room: &Room, message: &MirroredMessage) -> Option<PathBuf> {
        match self.write(room, message).await {
            Ok(MirrorOutcome::Written(path)) => Some(path),
            Ok(MirrorOutcome::Duplicate(path)) => {
                debug!("{} already mirrored", path.display());
                None
            }
            Err(e) => {
                error!(
                    "failed to mirror event {} from {} in {}: {}",
                    message.event_id, message.sender, message.room_id, e
                );
                None
            }
        }
    }

    /// Mirrors `message` into the tree.
    ///
    /// Creates the room and sender directories, refreshes the room name file,
    /// then writes the message body if the message file does not exist yet and
    /// sets its access and modification times to the server timestamp.
    pub async fn write(
        &self,
        room: &Room,
        message: &MirroredMessage,
    ) -> Result<MirrorOutcome, MirrorError> {
        for component in [&message.room_id, &message.sender, &message.event_id] {
            check_component(component)?;
        }

        let room_dir = self.tree.room_dir(&message.room_id);
        create_private_dir(&room_dir).await?;

        let sender_dir = self.tree.sender_dir(&message.room_id, &message.sender);
        create_private_dir(&sender_dir).await?;

        // The name is not part of the dedup key, it is refreshed on every message
        fs::write(self.tree.name_path(&message.room_id), &room.display_name).await?;

        let path = self
            .tree
            .message_path(&message.room_id, &message.sender, &message.event_id);
        if fs::try_exists(&path).await? {
            return Ok(MirrorOutcome::Duplicate(path));
        }

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Ok(MirrorOutcome::Duplicate(path));
            }
            Err(e) => return Err(e.into()),
        };

        let timestamp = UNIX_EPOCH + Duration::from_millis(message.server_timestamp_ms);
        if let Err(e) = fill_message_file(file, message.body.as_bytes(), timestamp).await {
            // A partial file would pass the dedup check on redelivery
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!(
                    "failed to remove partial message {}: {}",
                    path.display(),
                    remove_err
                );
            }
            return Err(e.into());
        }

        trace!("wrote {}", path.display());
        Ok(MirrorOutcome::Written(path))
    }
}

/// Writes `body` into a freshly created message file and stamps it.
async fn fill_message_file(mut file: File, body: &[u8], timestamp: SystemTime) -> io::Result<()> {
    file.write_all(body).await?;
    file.flush().await?;

    let file = file.into_std().await;
    file.set_times(
        FileTimes::new()
            .set_accessed(timestamp)
            .set_modified(timestamp),
    )
}

/// Creates `path` and its missing parents, owner-only.
pub async fn create_private_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
        .await
}

/// Rejects ids that are not a single, normal path component.
fn check_component(component: &str) -> Result<(), MirrorError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\0'])
    {
        return Err(MirrorError::UnsafeComponent(component.to_owned()));
    }
    Ok(())
}
