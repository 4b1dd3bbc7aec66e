//! Mirroring of incoming messages into the mailbox tree.
//!
//! - [`MailboxTree`] computes every path of the tree
//! - [`MirrorWriter`] writes each message exactly once, restoring its timestamp
//!
//! # Example
//!
//! ```no_run
//! use mpmc::mirror::{MailboxTree, MirrorWriter};
//!
//! # async fn example(room: mpmc::matrix::Room, message: mpmc::matrix::MirroredMessage) {
//! let tree = MailboxTree::new("/tmp/mm".as_ref(), "example.org", "alice");
//! let writer = MirrorWriter::new(tree);
//!
//! if let Some(path) = writer.on_message(&room, &message).await {
//!     println!("{}", path.display());
//! }
//! # }
//! ```

mod paths;
mod writer;

pub use crate::mirror::paths::MailboxTree;
pub use crate::mirror::writer::{MirrorWriter, create_private_dir};
