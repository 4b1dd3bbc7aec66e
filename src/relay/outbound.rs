//! Per-room relay from the FIFO to the room.

use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::{Context, anyhow};
use log::{debug, error, info};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::relay::{MessageSender, conduit::wake_reader};

/// Lines read but not yet sent before the reader thread waits.
const LINE_BUFFER: usize = 64;

/// How often a reader still blocked in `open` is woken after cancellation.
const WAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Relays the lines written to one room's FIFO into that room.
///
/// A dedicated OS thread blocks on the FIFO and forwards lines through a
/// bounded channel; [`OutboundRelay::run`] sends them one by one, in the order
/// they were read.
pub struct OutboundRelay {
    room_id: String,
    conduit: PathBuf,
    sender: Arc<dyn MessageSender>,
}

/// Handle to a running relay.
///
/// Cancelling the handle stops the relay once its reader is between two
/// writers; a reader blocked in `open` is woken up.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    pub room_id: String,
    cancel: CancellationToken,
}

impl RelayHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl OutboundRelay {
    /// Creates a relay for `room_id` reading the FIFO at `conduit`.
    ///
    /// The FIFO must already exist, see [`crate::relay::create_conduit`].
    pub fn new(room_id: &str, conduit: PathBuf, sender: Arc<dyn MessageSender>) -> Self {
        OutboundRelay {
            room_id: room_id.to_owned(),
            conduit,
            sender,
        }
    }

    /// Returns a handle stopping this relay through `cancel`.
    pub fn handle(&self, cancel: &CancellationToken) -> RelayHandle {
        RelayHandle {
            room_id: self.room_id.clone(),
            cancel: cancel.clone(),
        }
    }

    /// Runs the relay until `cancel` fires or the FIFO can no longer be read.
    ///
    /// End of input never stops the relay: the FIFO is reopened and the
    /// reader waits for the next writer. A failed send is logged and the relay
    /// moves on to the next line.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader thread cannot be started, fails to open
    /// or read the FIFO, or panics.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), anyhow::Error> {
        info!("relaying {} to {}", self.conduit.display(), self.room_id);

        let (line_tx, mut line_rx) = mpsc::channel(LINE_BUFFER);
        let (done_tx, done_rx) = oneshot::channel();

        let conduit = self.conduit.clone();
        let reader_cancel = cancel.clone();
        thread::Builder::new()
            .name(format!("relay {}", self.room_id))
            .spawn(move || {
                let result = read_conduit(&conduit, &line_tx, &reader_cancel);
                let _ = done_tx.send(result);
            })
            .context("failed to start relay thread")?;

        let mut cancelled = false;
        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => self.forward(&line).await,
                    // The reader thread is gone
                    None => break,
                },
                _ = cancel.cancelled(), if !cancelled => {
                    debug!("stopping relay of {}", self.room_id);
                    cancelled = true;
                    wake_reader(&self.conduit);
                }
                _ = sleep(WAKE_INTERVAL), if cancelled => wake_reader(&self.conduit),
            }
        }

        match done_rx.await {
            Ok(Ok(())) => {
                info!("relay of {} stopped", self.room_id);
                Ok(())
            }
            Ok(Err(e)) => Err(e).with_context(|| {
                format!("failed to read {} for {}", self.conduit.display(), self.room_id)
            }),
            Err(_) => Err(anyhow!("relay thread of {} panicked", self.room_id)),
        }
    }

    async fn forward(&self, line: &str) {
        debug!("sending {} bytes to {}", line.len(), self.room_id);

        if let Err(e) = self.sender.send_text(&self.room_id, line).await {
            error!("failed to send message to {}: {:#}", self.room_id, e);
        }
    }
}

/// Reads the FIFO forever, reopening it after each writer closes it.
///
/// Runs on a dedicated thread: `File::open` blocks until a writer shows up and
/// reads block until data or end of input.
fn read_conduit(
    path: &Path,
    lines: &mpsc::Sender<String>,
    cancel: &CancellationToken,
) -> io::Result<()> {
    while !cancel.is_cancelled() {
        let file = File::open(path)?;
        if cancel.is_cancelled() {
            break;
        }

        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            if reader.read_until(b'\n', &mut buffer)? == 0 {
                // The writer closed its end
                break;
            }

            let Some(line) = decode_line(&buffer) else {
                continue;
            };
            if lines.blocking_send(line).is_err() {
                // Nobody sends anymore
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Strips the line terminator, `None` for an empty line.
fn decode_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(raw).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MockMessageSender, create_conduit};
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle, time::timeout};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Starts a relay whose sends are recorded, the first `failures` sends fail.
    async fn start_relay(
        temp_dir: &TempDir,
        failures: usize,
    ) -> (
        PathBuf,
        CancellationToken,
        JoinHandle<Result<(), anyhow::Error>>,
        UnboundedReceiver<(String, String)>,
    ) {
        let conduit = temp_dir.path().join("in");
        create_conduit(&conduit).await.unwrap();

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let mut sender = MockMessageSender::new();
        let mut calls = 0;
        sender.expect_send_text().returning(move |room_id, text| {
            calls += 1;
            sent_tx
                .send((room_id.to_string(), text.to_string()))
                .unwrap();
            if calls <= failures {
                return Err(anyhow!("M_LIMIT_EXCEEDED"));
            }
            Ok(())
        });

        let cancel = CancellationToken::new();
        let relay = OutboundRelay::new("!r:example.org", conduit.clone(), Arc::new(sender));
        let task = tokio::spawn(relay.run(cancel.clone()));

        (conduit, cancel, task, sent_rx)
    }

    /// Opens the FIFO as a writer, writes `data` and closes it.
    async fn write_conduit(path: &Path, data: &'static str) {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            file.write_all(data.as_bytes()).unwrap();
        })
        .await
        .unwrap();
    }

    async fn next_sent(sent: &mut UnboundedReceiver<(String, String)>) -> String {
        let (room_id, text) = timeout(TEST_TIMEOUT, sent.recv())
            .await
            .expect("no message sent in time")
            .unwrap();
        assert_eq!(room_id, "!r:example.org");
        text
    }

    async fn stop(cancel: CancellationToken, task: JoinHandle<Result<(), anyhow::Error>>) {
        cancel.cancel();
        timeout(TEST_TIMEOUT, task)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_lines_are_sent_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let (conduit, cancel, task, mut sent) = start_relay(&temp_dir, 0).await;

        write_conduit(&conduit, "hello\nworld\n").await;

        assert_eq!(next_sent(&mut sent).await, "hello");
        assert_eq!(next_sent(&mut sent).await, "world");

        stop(cancel, task).await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_conduit_is_reopened_after_end_of_input() {
        let temp_dir = TempDir::new().unwrap();
        let (conduit, cancel, task, mut sent) = start_relay(&temp_dir, 0).await;

        write_conduit(&conduit, "one\n").await;
        assert_eq!(next_sent(&mut sent).await, "one");

        write_conduit(&conduit, "two\n").await;
        assert_eq!(next_sent(&mut sent).await, "two");

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_unterminated_line_is_sent_on_close() {
        let temp_dir = TempDir::new().unwrap();
        let (conduit, cancel, task, mut sent) = start_relay(&temp_dir, 0).await;

        write_conduit(&conduit, "no newline").await;
        assert_eq!(next_sent(&mut sent).await, "no newline");

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_empty_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let (conduit, cancel, task, mut sent) = start_relay(&temp_dir, 0).await;

        write_conduit(&conduit, "a\n\n\r\nb\n").await;
        assert_eq!(next_sent(&mut sent).await, "a");
        assert_eq!(next_sent(&mut sent).await, "b");

        stop(cancel, task).await;
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_relay() {
        let temp_dir = TempDir::new().unwrap();
        let (conduit, cancel, task, mut sent) = start_relay(&temp_dir, 1).await;

        write_conduit(&conduit, "lost\nkept\n").await;
        assert_eq!(next_sent(&mut sent).await, "lost");
        assert_eq!(next_sent(&mut sent).await, "kept");

        stop(cancel, task).await;
    }

    #[tokio::test]
    async fn test_idle_relay_stops_on_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let (_conduit, cancel, task, _sent) = start_relay(&temp_dir, 0).await;

        let relay_cancel = cancel.clone();
        let handle = RelayHandle {
            room_id: "!r:example.org".to_string(),
            cancel: relay_cancel,
        };
        handle.stop();

        timeout(TEST_TIMEOUT, task)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_conduit_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let sender = MockMessageSender::new();
        let relay = OutboundRelay::new(
            "!r:example.org",
            temp_dir.path().join("missing"),
            Arc::new(sender),
        );

        let result = timeout(TEST_TIMEOUT, relay.run(CancellationToken::new()))
            .await
            .expect("relay did not return");
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"hello\n"), Some("hello".to_string()));
        assert_eq!(decode_line(b"hello\r\n"), Some("hello".to_string()));
        assert_eq!(decode_line(b"hello"), Some("hello".to_string()));
        assert_eq!(decode_line(b"  \n"), Some("  ".to_string()));
        assert_eq!(decode_line(b"\n"), None);
        assert_eq!(decode_line(b"caf\xc3\xa9\n"), Some("café".to_string()));
        assert_eq!(decode_line(b"\xff\n"), Some("\u{fffd}".to_string()));
    }
}
