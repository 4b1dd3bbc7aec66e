//! Mailbox tree layout.
//!
//! ```text
//! <base>/<homeserver>/<user>/<room id>/name
//! <base>/<homeserver>/<user>/<room id>/in
//! <base>/<homeserver>/<user>/<room id>/<sender id>/<event id>:<homeserver>
//! ```
//!
//! Every path is a pure function of its inputs, so the existence of a message
//! file is enough to know the message was already mirrored.

use std::path::{Path, PathBuf};

/// File holding the current display name of a room.
pub const NAME_FILE: &str = "name";
/// Named pipe relaying text into a room.
pub const CONDUIT_FILE: &str = "in";

/// Mailbox tree of one account on one homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxTree {
    /// `<base>/<homeserver>/<user>`
    account_dir: PathBuf,
    homeserver: String,
}

impl MailboxTree {
    /// Creates the layout rooted at `base_dir` for `user` on `homeserver`.
    pub fn new(base_dir: &Path, homeserver: &str, user: &str) -> Self {
        MailboxTree {
            account_dir: base_dir.join(homeserver).join(user),
            homeserver: homeserver.to_owned(),
        }
    }

    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }

    pub fn room_dir(&self, room_id: &str) -> PathBuf {
        self.account_dir.join(room_id)
    }

    pub fn name_path(&self, room_id: &str) -> PathBuf {
        self.room_dir(room_id).join(NAME_FILE)
    }

    pub fn conduit_path(&self, room_id: &str) -> PathBuf {
        self.room_dir(room_id).join(CONDUIT_FILE)
    }

    pub fn sender_dir(&self, room_id: &str, sender: &str) -> PathBuf {
        self.room_dir(room_id).join(sender)
    }

    /// Path of the file holding one message.
    pub fn message_path(&self, room_id: &str, sender: &str, event_id: &str) -> PathBuf {
        self.sender_dir(room_id, sender)
            .join(format!("{}:{}", event_id, self.homeserver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> MailboxTree {
        MailboxTree::new(Path::new("/tmp/mm"), "example.org", "alice")
    }

    #[test]
    fn test_message_path_scenario() {
        let path = tree().message_path("!r:example.org", "@bob:example.org", "$evt1");
        assert_eq!(
            path,
            PathBuf::from("/tmp/mm/example.org/alice/!r:example.org/@bob:example.org/$evt1:example.org")
        );
    }

    #[test]
    fn test_message_path_is_deterministic() {
        let first = tree().message_path("!r:example.org", "@bob:example.org", "$evt1");
        let second = MailboxTree::new(Path::new("/tmp/mm"), "example.org", "alice").message_path(
            "!r:example.org",
            "@bob:example.org",
            "$evt1",
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_events_have_distinct_paths() {
        let tree = tree();
        let first = tree.message_path("!r:example.org", "@bob:example.org", "$evt1");
        let second = tree.message_path("!r:example.org", "@bob:example.org", "$evt2");
        assert_ne!(first, second);
        assert_eq!(first.parent(), second.parent());
    }

    #[test]
    fn test_room_files() {
        let tree = tree();
        assert_eq!(
            tree.name_path("!r:example.org"),
            PathBuf::from("/tmp/mm/example.org/alice/!r:example.org/name")
        );
        assert_eq!(
            tree.conduit_path("!r:example.org"),
            PathBuf::from("/tmp/mm/example.org/alice/!r:example.org/in")
        );
    }

    #[test]
    fn test_trailing_slash_in_base_dir_is_irrelevant() {
        let with_slash = MailboxTree::new(Path::new("/tmp/mm/"), "example.org", "alice");
        assert_eq!(with_slash, tree());
    }
}
