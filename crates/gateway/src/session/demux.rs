//! Splits a session's inbound traffic into two ordered byte streams.
//!
//! Front-end input arrives as room messages; backend output arrives as raw
//! chunks. The demux strips the envelopes and hands plain bytes to the
//! bridge, one task per direction, so a stalled side never holds up the
//! other.

use bytes::Bytes;
use protocol::{EventKind, RoomMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTPUT_QUEUE_SIZE: usize = 1;

/// Output queues of a running demux.
pub struct StreamDemux {
    /// User input bytes, in arrival order.
    pub user_out: mpsc::Receiver<Bytes>,
    /// Backend output bytes, in arrival order.
    pub srv_out: mpsc::Receiver<Bytes>,
}

impl StreamDemux {
    /// Starts both forwarding tasks.
    ///
    /// Each output closes when its input closes or when `closed` is
    /// cancelled. Non-data and empty user messages are dropped.
    pub fn spawn(
        user_in: mpsc::Receiver<RoomMessage>,
        srv_in: mpsc::Receiver<Bytes>,
        closed: CancellationToken,
    ) -> Self {
        let (user_tx, user_out) = mpsc::channel(OUTPUT_QUEUE_SIZE);
        let (srv_tx, srv_out) = mpsc::channel(OUTPUT_QUEUE_SIZE);

        tokio::spawn(forward_user(user_in, user_tx, closed.clone()));
        tokio::spawn(forward_srv(srv_in, srv_tx, closed));

        Self { user_out, srv_out }
    }
}

async fn forward_user(
    mut input: mpsc::Receiver<RoomMessage>,
    output: mpsc::Sender<Bytes>,
    closed: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            msg = input.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if msg.event != EventKind::Data || msg.body.is_empty() {
            tracing::debug!(event = %msg.event, user = %msg.meta.user, "Ignoring non-data input");
            continue;
        }

        tokio::select! {
            _ = closed.cancelled() => break,
            res = output.send(msg.body) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("User input forwarding ended");
}

async fn forward_srv(
    mut input: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<Bytes>,
    closed: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = closed.cancelled() => break,
            chunk = input.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        tokio::select! {
            _ = closed.cancelled() => break,
            res = output.send(chunk) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Backend output forwarding ended");
}
