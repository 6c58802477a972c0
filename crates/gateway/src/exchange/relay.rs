//! Cross-instance room relay.
//!
//! When several gateway instances serve the same users, an observer may be
//! connected to a different instance than the one bridging the session. The
//! bridging instance publishes room output on an output topic and accepts
//! observer input from an input topic; the observing instance mirrors the
//! output into a local room and publishes its observers' input.
//!
//! Messages travel as [`RoomMessage`] JSON. Ordering and delivery guarantees
//! are whatever the [`RoomRelay`] implementation provides.

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::{ProtocolError, RoomMessage};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::conn::{Conn, RoomStream};
use super::room::Room;

const LOCAL_TOPIC_CAPACITY: usize = 256;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The message could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] ProtocolError),

    /// The transport refused the message.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Publish side of a pub/sub transport.
pub trait RoomRelay: Send + Sync {
    /// Publishes one encoded message on a topic.
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>)
        -> BoxFuture<'a, Result<(), RelayError>>;
}

/// Topic carrying a room's output.
pub fn output_topic(room_id: &str) -> String {
    format!("kubejump.room.{}.output", room_id)
}

/// Topic carrying observer input for a room.
pub fn input_topic(room_id: &str) -> String {
    format!("kubejump.room.{}.input", room_id)
}

/// Observer that republishes everything a room broadcasts.
struct RelayStream {
    topic: String,
    relay: Arc<dyn RoomRelay>,
}

impl RelayStream {
    async fn publish(&self, msg: &RoomMessage) -> Result<(), RelayError> {
        let payload = msg.to_json()?;
        self.relay.publish(&self.topic, payload).await
    }
}

impl RoomStream for RelayStream {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if data.is_empty() {
                return Ok(0);
            }
            self.publish(&RoomMessage::data(bytes::Bytes::copy_from_slice(data)))
                .await
                .map_err(io::Error::other)?;
            Ok(data.len())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(e) = self.publish(msg).await {
                tracing::warn!(topic = %self.topic, event = %msg.event, error = %e, "Relay publish failed");
            }
        })
    }
}

/// Subscribes an observer that publishes the room's output on
/// [`output_topic`]. Unsubscribe the returned observer to stop relaying.
pub async fn publish_output(room: &Room, relay: Arc<dyn RoomRelay>) -> Conn {
    let stream = RelayStream {
        topic: output_topic(room.id()),
        relay,
    };
    let conn = Conn::new(Arc::new(stream));
    room.subscribe(conn.clone()).await;
    tracing::info!(room_id = %room.id(), conn_id = %conn.id(), "Room output relayed");
    conn
}

/// Feeds observer input arriving from other instances into a room.
///
/// Runs until the room finishes or the subscription closes.
pub fn forward_input(room: Room, inbound: broadcast::Receiver<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(pump_inbound(room, inbound, Direction::Input))
}

/// Mirrors another instance's room output into a local room.
///
/// Runs until the room finishes or the subscription closes.
pub fn mirror_output(room: Room, inbound: broadcast::Receiver<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(pump_inbound(room, inbound, Direction::Output))
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Input,
    Output,
}

async fn pump_inbound(room: Room, mut inbound: broadcast::Receiver<Vec<u8>>, direction: Direction) {
    loop {
        let payload = tokio::select! {
            _ = room.done() => break,
            res = inbound.recv() => match res {
                Ok(payload) => payload,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(room_id = %room.id(), skipped, "Relay subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        };

        let msg = match RoomMessage::from_json(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(room_id = %room.id(), error = %e, "Dropping malformed relay message");
                continue;
            }
        };

        match direction {
            Direction::Input => room.receive(msg).await,
            Direction::Output => room.broadcast(msg).await,
        }
    }

    tracing::debug!(room_id = %room.id(), ?direction, "Relay forwarding ended");
}

/// In-process relay built on broadcast channels.
///
/// Useful for a single instance hosting several front-ends and for tests.
#[derive(Default)]
pub struct LocalRelay {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl LocalRelay {
    /// Creates a relay without topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a topic, creating it if needed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_TOPIC_CAPACITY).0)
            .subscribe()
    }
}

impl RoomRelay for LocalRelay {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), RelayError>> {
        Box::pin(async move {
            // Publishing without subscribers is not an error.
            if let Some(sender) = self.topics.get(topic) {
                let _ = sender.send(payload);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::RoomOptions;
    use crate::testing::RecordingStream;
    use protocol::{EventKind, MetaMessage};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_topics_are_per_room() {
        assert_eq!(output_topic("s-1"), "kubejump.room.s-1.output");
        assert_eq!(input_topic("s-1"), "kubejump.room.s-1.input");
    }

    #[tokio::test]
    async fn test_room_output_is_published() {
        let relay = Arc::new(LocalRelay::new());
        let mut sub = relay.subscribe(&output_topic("s-1"));
        let (tx, _rx) = mpsc::channel(1);
        let room = Room::create("s-1", tx, RoomOptions::default());

        publish_output(&room, relay.clone()).await;
        // drain catch-up
        let first = sub.recv().await.unwrap();
        assert_eq!(
            RoomMessage::from_json(&first).unwrap().event,
            EventKind::ShareUsers
        );

        room.broadcast(RoomMessage::data("out")).await;
        let payload = tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timeout")
            .unwrap();
        let msg = RoomMessage::from_json(&payload).unwrap();
        assert_eq!(msg.event, EventKind::Data);
        assert_eq!(msg.body.as_ref(), b"out");
    }

    #[tokio::test]
    async fn test_remote_input_reaches_session() {
        let relay = LocalRelay::new();
        let (tx, mut input) = mpsc::channel(4);
        let room = Room::create("s-2", tx, RoomOptions::default());
        forward_input(room, relay.subscribe(&input_topic("s-2")));

        let msg = RoomMessage::data("id\r").with_meta(MetaMessage {
            user: "Bob(bob)".to_string(),
            ..Default::default()
        });
        relay
            .publish(&input_topic("s-2"), msg.to_json().unwrap())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_millis(100), input.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(received.meta.user, "Bob(bob)");
        assert_eq!(received.body.as_ref(), b"id\r");
    }

    #[tokio::test]
    async fn test_mirror_skips_malformed_payloads() {
        let relay = LocalRelay::new();
        let (tx, _rx) = mpsc::channel(1);
        let mirror = Room::create("s-3", tx, RoomOptions::default());
        let stream = Arc::new(RecordingStream::new());
        mirror.subscribe(Conn::new(stream.clone())).await;
        mirror_output(mirror.clone(), relay.subscribe(&output_topic("s-3")));

        let topic = output_topic("s-3");
        relay.publish(&topic, b"not json".to_vec()).await.unwrap();
        relay
            .publish(&topic, RoomMessage::data("mirrored").to_json().unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_millis(200), async {
            while stream.written().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("mirror never delivered");
        assert_eq!(stream.written(), b"mirrored");
    }

    #[tokio::test]
    async fn test_forwarding_stops_with_room() {
        let relay = LocalRelay::new();
        let (tx, _rx) = mpsc::channel(1);
        let room = Room::create("s-4", tx, RoomOptions::default());
        let handle = forward_input(room.clone(), relay.subscribe(&input_topic("s-4")));

        room.stop();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("forwarder did not stop")
            .unwrap();
    }
}
