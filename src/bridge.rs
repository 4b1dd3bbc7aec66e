//! Bridge controller tying the Matrix client, the mirror and the relays together.
//!
//! # Lifecycle
//!
//! ```text
//! Starting → SessionEstablished → RoomDiscovery → Running → ShuttingDown
//! ```
//!
//! - **Starting**: the account directory is created and the session resolved
//!   through the credential commands
//! - **SessionEstablished**: the mirror callback (and optionally auto-join) is
//!   registered on the client
//! - **RoomDiscovery**: one sync learns the joined rooms, each gets a FIFO and
//!   a relay
//! - **Running**: the sync loop and the relays run concurrently. Rooms first
//!   seen later (a message, an accepted invite) get their relay on the fly
//! - **ShuttingDown**: an interrupt or the exit of any task cancels everything
//!
//! Every failure before `Running` is fatal. Once running, per-message and
//! per-line failures are logged and dropped, only the exit of a whole task
//! ends the bridge.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::{
    signal::{
        self,
        unix::{SignalKind, signal as unix_signal},
    },
    sync::mpsc,
    task::JoinSet,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    matrix::{MatrixClient, Room, resolve_session},
    mirror::{MailboxTree, MirrorWriter, create_private_dir},
    relay::{MessageSender, OutboundRelay, RelayHandle, create_conduit},
    shell::ShellRunner,
};

/// Time left to the tasks to stop on their own before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Name and result of a supervised task.
type TaskOutcome = (String, Result<(), anyhow::Error>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    SessionEstablished,
    RoomDiscovery,
    Running,
    ShuttingDown,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Starting => "starting",
            BridgeState::SessionEstablished => "session established",
            BridgeState::RoomDiscovery => "room discovery",
            BridgeState::Running => "running",
            BridgeState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Why a running bridge stopped.
#[derive(Debug)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Interrupted,
    /// A supervised task exited, with its error if any
    TaskExited {
        task: String,
        error: Option<anyhow::Error>,
    },
}

impl ShutdownReason {
    /// Process exit status for this shutdown.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Interrupted => 0,
            ShutdownReason::TaskExited { .. } => 1,
        }
    }
}

/// The Matrix to filesystem bridge of one account.
pub struct Bridge {
    config: Config,
    client: Arc<MatrixClient>,
    writer: MirrorWriter,
    state: BridgeState,
}

impl Bridge {
    /// Prepares the mailbox tree and authenticates the account.
    ///
    /// # Errors
    ///
    /// Returns an error if the account directory cannot be created, the client
    /// cannot be built or no session can be established.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        info!("bridge {}", BridgeState::Starting);

        let tree = MailboxTree::new(&config.directory, &config.homeserver, &config.user);
        create_private_dir(tree.account_dir())
            .await
            .with_context(|| format!("failed to create {}", tree.account_dir().display()))?;

        let user_id = config.user_id();
        let client = MatrixClient::new(&config.homeserver, &user_id, config.store_path.as_deref())
            .await?;

        resolve_session(
            &ShellRunner,
            &client,
            &config.homeserver,
            &user_id,
            &config.credential_commands(),
            &config.device_name,
        )
        .await?;

        let mut bridge = Bridge {
            config,
            client: Arc::new(client),
            writer: MirrorWriter::new(tree),
            state: BridgeState::Starting,
        };
        bridge.set_state(BridgeState::SessionEstablished);

        Ok(bridge)
    }

    fn set_state(&mut self, state: BridgeState) {
        debug!("bridge state {} -> {}", self.state, state);
        self.state = state;
        info!("bridge {}", state);
    }

    /// Runs the bridge until an interrupt or the exit of one of its tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if room discovery fails. Failures once running are
    /// reported through [`ShutdownReason::TaskExited`].
    pub async fn run(mut self) -> Result<ShutdownReason, anyhow::Error> {
        let (room_tx, mut room_rx) = mpsc::unbounded_channel::<Room>();
        self.register_handlers(room_tx);

        self.set_state(BridgeState::RoomDiscovery);
        let since = self.client.sync_once(Duration::ZERO).await?;
        let rooms = self.client.joined_rooms().await;
        info!("found {} joined rooms", rooms.len());

        let cancel = CancellationToken::new();
        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

        let sender: Arc<dyn MessageSender> = self.client.clone();
        let mut relays = Relays::new(self.writer.tree().clone(), sender, cancel.child_token());
        for room in rooms {
            relays.ensure(room, &mut tasks).await;
        }

        self.set_state(BridgeState::Running);
        {
            let client = Arc::clone(&self.client);
            let timeout = Duration::from_millis(self.config.sync_timeout_ms);
            let cancel = cancel.child_token();
            tasks.spawn(async move {
                let result = client.sync_forever(since, timeout, cancel).await;
                ("sync".to_string(), result)
            });
        }

        let reason = supervise(&mut tasks, &mut relays, &mut room_rx, shutdown_signal()).await;

        self.set_state(BridgeState::ShuttingDown);
        relays.stop_all();
        cancel.cancel();
        drain(&mut tasks, SHUTDOWN_GRACE).await;

        Ok(reason)
    }

    /// Registers the mirror callback and, if enabled, auto-join.
    ///
    /// Every room seen through either is reported on `room_tx` so that it gets
    /// a relay.
    fn register_handlers(&self, room_tx: mpsc::UnboundedSender<Room>) {
        let writer = self.writer.clone();
        let message_tx = room_tx.clone();
        self.client.on_text_message(move |room, message| {
            let writer = writer.clone();
            let room_tx = message_tx.clone();
            async move {
                if let Some(path) = writer.on_message(&room, &message).await {
                    // Downstream tools read new message paths from stdout
                    println!("{}", path.display());
                }
                let _ = room_tx.send(room);
            }
        });

        if self.config.auto_join {
            info!("accepting room invites automatically");
            self.client.auto_join(move |room| {
                let _ = room_tx.send(room);
            });
        }
    }
}

/// Waits for `shutdown` or the first task to exit, starting relays for the
/// rooms reported on `room_rx` meanwhile.
async fn supervise<S>(
    tasks: &mut JoinSet<TaskOutcome>,
    relays: &mut Relays,
    room_rx: &mut mpsc::UnboundedReceiver<Room>,
    shutdown: S,
) -> ShutdownReason
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => break ShutdownReason::Interrupted,
            Some(room) = room_rx.recv() => relays.ensure(room, tasks).await,
            Some(outcome) = tasks.join_next() => {
                break match outcome {
                    Ok((task, result)) => ShutdownReason::TaskExited { task, error: result.err() },
                    Err(e) => ShutdownReason::TaskExited {
                        task: "unknown".to_string(),
                        error: Some(e.into()),
                    },
                };
            }
        }
    };

    match &reason {
        ShutdownReason::Interrupted => info!("interrupted"),
        ShutdownReason::TaskExited { task, error: Some(e) } => {
            error!("{} failed: {:#}", task, e)
        }
        ShutdownReason::TaskExited { task, error: None } => warn!("{} ended", task),
    }

    reason
}

/// Waits up to `grace` for the cancelled tasks, then aborts the rest.
///
/// Returns `true` if every task stopped on its own.
async fn drain(tasks: &mut JoinSet<TaskOutcome>, grace: Duration) -> bool {
    let drained = time::timeout(grace, async {
        while let Some(outcome) = tasks.join_next().await {
            if let Ok((task, Err(e))) = outcome {
                debug!("{} stopped with error: {:#}", task, e);
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!("aborting {} remaining tasks", tasks.len());
        tasks.shutdown().await;
        return false;
    }
    true
}

/// Known rooms and their relays.
struct Relays {
    tree: MailboxTree,
    sender: Arc<dyn MessageSender>,
    cancel: CancellationToken,
    rooms: HashMap<String, Room>,
    handles: Vec<RelayHandle>,
}

impl Relays {
    fn new(tree: MailboxTree, sender: Arc<dyn MessageSender>, cancel: CancellationToken) -> Self {
        Relays {
            tree,
            sender,
            cancel,
            rooms: HashMap::new(),
            handles: Vec::new(),
        }
    }

    /// Starts a relay for `room` unless the room is already known.
    ///
    /// A room whose FIFO cannot be created stays known without a relay, it
    /// is still mirrored.
    async fn ensure(&mut self, room: Room, tasks: &mut JoinSet<TaskOutcome>) {
        if let Some(known) = self.rooms.get_mut(&room.room_id) {
            if known.display_name != room.display_name {
                info!(
                    "room {} renamed from {:?} to {:?}",
                    room.room_id, known.display_name, room.display_name
                );
                known.display_name = room.display_name;
            }
            return;
        }

        let room_id = room.room_id.clone();
        self.rooms.insert(room_id.clone(), room);

        let conduit = self.tree.conduit_path(&room_id);
        if let Err(e) = create_conduit(&conduit).await {
            error!("no relay for {}, failed to create {}: {}", room_id, conduit.display(), e);
            return;
        }

        let relay = OutboundRelay::new(&room_id, conduit, Arc::clone(&self.sender));
        let cancel = self.cancel.child_token();
        self.handles.push(relay.handle(&cancel));

        tasks.spawn(async move {
            let result = relay.run(cancel).await;
            (format!("relay of {}", room_id), result)
        });
    }

    fn stop_all(&self) {
        for handle in &self.handles {
            debug!("stopping relay of {}", handle.room_id);
            handle.stop();
        }
    }

    #[cfg(test)]
    fn is_relayed(&self, room_id: &str) -> bool {
        self.handles.iter().any(|handle| handle.room_id == room_id)
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MockMessageSender;
    use std::{io::Write, os::unix::fs::FileTypeExt};
    use tempfile::TempDir;

    fn room(room_id: &str, display_name: &str) -> Room {
        Room {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
        }
    }

    fn relays(temp_dir: &TempDir, sender: MockMessageSender, cancel: &CancellationToken) -> Relays {
        let tree = MailboxTree::new(temp_dir.path(), "example.org", "alice");
        Relays::new(tree, Arc::new(sender), cancel.child_token())
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::Interrupted.exit_code(), 0);
        let failed = ShutdownReason::TaskExited {
            task: "sync".to_string(),
            error: Some(anyhow::anyhow!("connection reset")),
        };
        assert_eq!(failed.exit_code(), 1);
        let ended = ShutdownReason::TaskExited {
            task: "sync".to_string(),
            error: None,
        };
        assert_eq!(ended.exit_code(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BridgeState::RoomDiscovery.to_string(), "room discovery");
        assert_eq!(BridgeState::ShuttingDown.to_string(), "shutting down");
    }

    #[tokio::test]
    async fn test_ensure_creates_conduit_once() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut relays = relays(&temp_dir, MockMessageSender::new(), &cancel);
        let mut tasks = JoinSet::new();

        relays.ensure(room("!r:example.org", "Room"), &mut tasks).await;
        relays.ensure(room("!r:example.org", "Renamed"), &mut tasks).await;

        let conduit = temp_dir.path().join("example.org/alice/!r:example.org/in");
        assert!(std::fs::metadata(&conduit).unwrap().file_type().is_fifo());
        assert_eq!(tasks.len(), 1);
        assert!(relays.is_relayed("!r:example.org"));
        assert_eq!(relays.rooms["!r:example.org"].display_name, "Renamed");

        relays.stop_all();
        let (task, result) = tasks.join_next().await.unwrap().unwrap();
        assert_eq!(task, "relay of !r:example.org");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_relays_lines_to_room() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();

        let mut sender = MockMessageSender::new();
        sender.expect_send_text().returning(move |room_id, text| {
            sent_tx.send((room_id.to_string(), text.to_string())).unwrap();
            Ok(())
        });

        let mut relays = relays(&temp_dir, sender, &cancel);
        let mut tasks = JoinSet::new();
        relays.ensure(room("!r:example.org", "Room"), &mut tasks).await;

        let conduit = temp_dir.path().join("example.org/alice/!r:example.org/in");
        let writer = tokio::task::spawn_blocking(move || {
            let mut fifo = std::fs::OpenOptions::new().write(true).open(conduit).unwrap();
            fifo.write_all(b"hello\n").unwrap();
        });
        writer.await.unwrap();

        let (room_id, text) = sent_rx.recv().await.unwrap();
        assert_eq!(room_id, "!r:example.org");
        assert_eq!(text, "hello");

        relays.stop_all();
        let (_, result) = tasks.join_next().await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_skips_relay_when_conduit_fails() {
        let temp_dir = TempDir::new().unwrap();
        // A directory where the FIFO should go
        std::fs::create_dir_all(temp_dir.path().join("example.org/alice/!r:example.org/in"))
            .unwrap();

        let cancel = CancellationToken::new();
        let mut relays = relays(&temp_dir, MockMessageSender::new(), &cancel);
        let mut tasks = JoinSet::new();

        relays.ensure(room("!r:example.org", "Room"), &mut tasks).await;

        assert!(tasks.is_empty());
        assert!(!relays.is_relayed("!r:example.org"));
        assert!(relays.rooms.contains_key("!r:example.org"));
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_every_relay() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut relays = relays(&temp_dir, MockMessageSender::new(), &cancel);
        let mut tasks = JoinSet::new();

        relays.ensure(room("!a:example.org", "A"), &mut tasks).await;
        relays.ensure(room("!b:example.org", "B"), &mut tasks).await;
        assert_eq!(tasks.len(), 2);

        cancel.cancel();

        let stopped = time::timeout(Duration::from_secs(5), async {
            let mut count = 0;
            while let Some(outcome) = tasks.join_next().await {
                assert!(outcome.unwrap().1.is_ok());
                count += 1;
            }
            count
        })
        .await
        .unwrap();
        assert_eq!(stopped, 2);
    }

    #[tokio::test]
    async fn test_failed_task_stops_every_relay() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut relays = relays(&temp_dir, MockMessageSender::new(), &cancel);
        let mut tasks = JoinSet::new();
        let (_room_tx, mut room_rx) = mpsc::unbounded_channel();

        relays.ensure(room("!a:example.org", "A"), &mut tasks).await;
        relays.ensure(room("!b:example.org", "B"), &mut tasks).await;
        tasks.spawn(async { ("sync".to_string(), Err(anyhow::anyhow!("connection reset"))) });

        let reason = supervise(
            &mut tasks,
            &mut relays,
            &mut room_rx,
            std::future::pending::<()>(),
        )
        .await;

        let ShutdownReason::TaskExited { task, error } = &reason else {
            panic!("bridge stopped without a task exit");
        };
        assert_eq!(task, "sync");
        assert!(error.is_some());
        assert_eq!(reason.exit_code(), 1);

        relays.stop_all();
        cancel.cancel();
        assert!(drain(&mut tasks, SHUTDOWN_GRACE).await);
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_room_reported_while_running_gets_relay() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut relays = relays(&temp_dir, MockMessageSender::new(), &cancel);
        let mut tasks = JoinSet::new();
        let (room_tx, mut room_rx) = mpsc::unbounded_channel();

        room_tx.send(room("!new:example.org", "New")).unwrap();

        let reason = supervise(
            &mut tasks,
            &mut relays,
            &mut room_rx,
            time::sleep(Duration::from_millis(200)),
        )
        .await;

        assert!(matches!(reason, ShutdownReason::Interrupted));
        assert_eq!(reason.exit_code(), 0);
        assert!(relays.is_relayed("!new:example.org"));
        let conduit = temp_dir.path().join("example.org/alice/!new:example.org/in");
        assert!(std::fs::metadata(&conduit).unwrap().file_type().is_fifo());

        relays.stop_all();
        assert!(drain(&mut tasks, SHUTDOWN_GRACE).await);
    }
}
