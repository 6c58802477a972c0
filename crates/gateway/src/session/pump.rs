//! Read loops feeding a bridged session.
//!
//! The backend pump reads shell output and queues it for the bridge without
//! ever splitting a UTF-8 character across two chunks. The front-end pump
//! reads keystrokes and submits them to the session's room as input.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{MetaMessage, RoomMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{ServerConnection, UserConnection};
use crate::exchange::Room;

/// Size of a single read from either connection.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Pause between the two halves of a line split at a carriage return.
pub const LINE_SPLIT_DELAY: Duration = Duration::from_millis(100);

/// Holds back a trailing partial UTF-8 sequence until it is complete.
///
/// Bytes that cannot start or continue a valid sequence are passed through
/// unchanged, so binary output is never stalled.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns everything that is safe to emit.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);
        let keep = incomplete_tail(&data);
        self.pending = data.split_off(data.len() - keep);
        data
    }

    /// Returns whatever is still held back.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of an unfinished multi-byte sequence at the end of `data`.
fn incomplete_tail(data: &[u8]) -> usize {
    let len = data.len();
    for back in 1..=len.min(3) {
        let byte = data[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Splits input at its first carriage return, keeping the carriage return
/// with the second half. Returns `None` when there is nothing to split.
///
/// The carriage return is the Enter keystroke. The first half carries only
/// the typed text, which the shell echoes as it would for any keystrokes.
/// The second half starts with Enter and submits the line, so the echo of the
/// typed text is delivered and rendered before the command runs, not batched
/// with its output. Only the first carriage return splits; the rest stay in
/// the second half. A chunk that starts with a carriage return has no typed
/// text to flush and is not split.
pub fn split_at_carriage_return(chunk: &Bytes) -> Option<(Bytes, Bytes)> {
    match chunk.iter().position(|&b| b == b'\r') {
        Some(index) if index > 0 => Some((chunk.slice(..index), chunk.slice(index..))),
        _ => None,
    }
}

/// Starts reading backend output into `out`.
///
/// The queue is closed when the backend reports end of stream or an error,
/// which is how the bridge learns that the shell went away.
pub(crate) fn spawn_backend_pump(
    session_id: String,
    srv: Arc<dyn ServerConnection>,
    out: mpsc::Sender<Bytes>,
    closed: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut acc = Utf8Accumulator::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let read = tokio::select! {
                _ = closed.cancelled() => break,
                read = srv.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    tracing::info!(session_id = %session_id, "Backend reached end of stream");
                    break;
                }
                Ok(n) => {
                    let chunk = acc.push(&buf[..n]);
                    if chunk.is_empty() {
                        continue;
                    }
                    if !send_or_closed(&out, Bytes::from(chunk), &closed).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Backend read failed");
                    break;
                }
            }
        }

        let rest = acc.finish();
        if !rest.is_empty() {
            send_or_closed(&out, Bytes::from(rest), &closed).await;
        }
        tracing::info!(session_id = %session_id, "Backend read loop ended");
    })
}

/// Starts reading user keystrokes into the room as input.
///
/// Signals `exit` once the front-end reports end of stream or an error.
pub(crate) fn spawn_frontend_pump(
    session_id: String,
    user: Arc<dyn UserConnection>,
    room: Room,
    meta: MetaMessage,
    closed: CancellationToken,
    exit: mpsc::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let read = tokio::select! {
                _ = closed.cancelled() => break,
                read = user.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    tracing::info!(session_id = %session_id, "User connection reached end of stream");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "User read failed");
                    break;
                }
            };

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            match split_at_carriage_return(&chunk) {
                Some((line, rest)) => {
                    room.receive(RoomMessage::data(line).with_meta(meta.clone()))
                        .await;
                    tokio::time::sleep(LINE_SPLIT_DELAY).await;
                    room.receive(RoomMessage::data(rest).with_meta(meta.clone()))
                        .await;
                }
                None => {
                    room.receive(RoomMessage::data(chunk).with_meta(meta.clone()))
                        .await;
                }
            }
        }

        tracing::info!(session_id = %session_id, "User read loop ended");
        let _ = exit.try_send(());
    })
}

async fn send_or_closed(out: &mpsc::Sender<Bytes>, chunk: Bytes, closed: &CancellationToken) -> bool {
    tokio::select! {
        _ = closed.cancelled() => false,
        res = out.send(chunk) => res.is_ok(),
    }
}
