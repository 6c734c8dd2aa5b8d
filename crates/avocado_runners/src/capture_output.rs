//! Forwarding of child process pipes into runner messages.

use std::io;
use std::sync::Arc;

use avocado_utils::net_protocol::messages::{Finished, Message, MessageKind};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::MessageSink;

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn message(self, bytes: &[u8]) -> Message {
        match self {
            Stream::Stdout => Message::stdout(bytes),
            Stream::Stderr => Message::stderr(bytes),
        }
    }
}

/// Streams every chunk read from `reader` as a `stdout`/`stderr` message.
/// When `keep` is set the full output is also returned.
pub(crate) fn forward_raw<R>(
    mut reader: R,
    stream: Stream,
    sink: MessageSink,
    keep: bool,
) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut buf = vec![0; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(kept);
            }
            if keep {
                kept.extend_from_slice(&buf[..n]);
            }
            sink.send(stream.message(&buf[..n])).await;
        }
    })
}

/// Where a `finished` relayed from a child is stored until the runner returns it.
pub(crate) type FinishedSlot = Arc<Mutex<Option<Finished>>>;

/// Reads JSON-line messages from a child that speaks the runner protocol.
///
/// Lines that are not messages are relayed verbatim as stdout; the first
/// `finished` is captured into `slot` instead of being forwarded.
pub(crate) fn forward_messages<R>(
    reader: R,
    sink: MessageSink,
    slot: FinishedSlot,
) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(Vec::new());
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Message>(&line) {
                Ok(Message {
                    kind: MessageKind::Finished(finished),
                    ..
                }) => {
                    slot.lock().get_or_insert(finished);
                }
                Ok(message) => sink.send(message).await,
                Err(_) => {
                    tracing::debug!("non-protocol output from child");
                    sink.send(Message::stdout(line.clone())).await;
                }
            }
        }
    })
}
