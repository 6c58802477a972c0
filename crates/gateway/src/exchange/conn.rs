//! Observer handles bound to a writable stream.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use protocol::{EventKind, RoomMessage};
use uuid::Uuid;

/// Output side of an observer.
///
/// Streams are shared between the room that delivers to them and whatever
/// created the underlying connection, so every method takes `&self`.
pub trait RoomStream: Send + Sync {
    /// Writes raw terminal bytes to the observer.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Closes the observer's stream.
    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>>;

    /// Delivers a non-data room event to the observer.
    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()>;
}

/// An observer subscribed (or about to be subscribed) to a room.
#[derive(Clone)]
pub struct Conn {
    id: String,
    stream: Arc<dyn RoomStream>,
    created_at: Instant,
}

impl Conn {
    /// Wraps a stream into a new observer with a fresh identifier.
    pub fn new(stream: Arc<dyn RoomStream>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            stream,
            created_at: Instant::now(),
        }
    }

    /// Returns the observer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns when the observer was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Delivers one room message according to its kind.
    ///
    /// Write failures are logged and otherwise ignored; the observer is not
    /// retried.
    pub async fn handle_message(&self, msg: &RoomMessage) {
        let result = match msg.event {
            EventKind::Data => self.stream.write(&msg.body).await.map(|_| ()),
            EventKind::Ping => self.stream.write(&[]).await.map(|_| ()),
            _ => {
                self.stream.handle_room_event(msg).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(
                conn_id = %self.id,
                event = %msg.event,
                error = %e,
                "Failed to deliver room message"
            );
        }
    }

    /// Closes the observer's stream.
    pub async fn close(&self) {
        if let Err(e) = self.stream.close().await {
            tracing::debug!(conn_id = %self.id, error = %e, "Observer close failed");
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}
