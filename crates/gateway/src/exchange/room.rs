//! Broadcast room of one bridged session.
//!
//! A room is a single task that owns all of its state. Handles talk to it
//! through a command queue, so subscription changes and broadcasts are
//! applied in the order they were submitted and observers never see a
//! half-applied subscription.
//!
//! ```text
//!  subscribe ─┐
//! unsubscribe ─┼──► command queue ──► room task ──► observers (fan-out)
//!   broadcast ─┘                        │
//!                                       └─ recent Data ring, online users,
//!                                          bulk-transfer flag
//!
//!     receive ────► input queue (owned by the session bridge)
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use protocol::{EventKind, MetaMessage, RoomMessage, ZMODEM_START_EVENT};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use super::conn::Conn;

/// Number of recent `Data` messages replayed to new observers.
pub const DEFAULT_REPLAY_SIZE: usize = 5;

/// How often an empty room checks whether it should shut down.
pub const DEFAULT_IDLE_CHECK: Duration = Duration::from_secs(60);

const COMMAND_QUEUE_SIZE: usize = 16;

/// Tunables of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomOptions {
    /// Size of the recent output ring.
    pub replay_size: usize,
    /// Idle shutdown check period.
    pub idle_check: Duration,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            replay_size: DEFAULT_REPLAY_SIZE,
            idle_check: DEFAULT_IDLE_CHECK,
        }
    }
}

enum RoomCommand {
    Subscribe {
        conn: Conn,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe {
        conn_id: String,
        ack: oneshot::Sender<()>,
    },
    Broadcast(RoomMessage),
    Count(oneshot::Sender<usize>),
}

/// Handle to a running room.
///
/// Handles are cheap to clone. The room task exits when it is stopped, when
/// it finds itself without observers on an idle check, or when every handle
/// is dropped.
#[derive(Clone)]
pub struct Room {
    id: Arc<str>,
    commands: mpsc::Sender<RoomCommand>,
    input: mpsc::Sender<RoomMessage>,
    stop: CancellationToken,
    done: CancellationToken,
}

impl Room {
    /// Starts a room.
    ///
    /// `input` is where messages passed to [`Room::receive`] are forwarded,
    /// typically the session's front-end input queue. Must be called from
    /// within a Tokio runtime. A zero `idle_check` falls back to
    /// [`DEFAULT_IDLE_CHECK`].
    pub fn create(
        id: impl Into<String>,
        input: mpsc::Sender<RoomMessage>,
        options: RoomOptions,
    ) -> Self {
        let id: Arc<str> = Arc::from(id.into());
        let idle_check = if options.idle_check.is_zero() {
            tracing::warn!(room_id = %id, "Zero idle check period, using default");
            DEFAULT_IDLE_CHECK
        } else {
            options.idle_check
        };
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let stop = CancellationToken::new();
        let done = CancellationToken::new();

        let state = RoomState::new(id.to_string(), options.replay_size);
        tokio::spawn(run_room(
            state,
            command_rx,
            idle_check,
            stop.clone(),
            done.clone(),
        ));

        tracing::debug!(room_id = %id, "Room started");

        Self {
            id,
            commands,
            input,
            stop,
            done,
        }
    }

    /// Returns the room identifier, equal to the session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Adds an observer and sends it the catch-up sequence.
    ///
    /// Returns once the observer is registered. Returns immediately without
    /// effect if the room has finished.
    pub async fn subscribe(&self, conn: Conn) {
        let (ack, acked) = oneshot::channel();
        if self.submit(RoomCommand::Subscribe { conn, ack }).await {
            let _ = acked.await;
        }
    }

    /// Removes an observer. Unknown observers are ignored.
    ///
    /// Returns once the room has dropped the observer, so no message
    /// broadcast after this call reaches it.
    pub async fn unsubscribe(&self, conn: &Conn) {
        let (ack, acked) = oneshot::channel();
        let cmd = RoomCommand::Unsubscribe {
            conn_id: conn.id().to_string(),
            ack,
        };
        if self.submit(cmd).await {
            let _ = acked.await;
        }
    }

    /// Queues a message for every observer.
    ///
    /// Dropped if the room has finished.
    pub async fn broadcast(&self, msg: RoomMessage) {
        self.submit(RoomCommand::Broadcast(msg)).await;
    }

    /// Forwards an observer's input to the session's input queue.
    ///
    /// Dropped if the room has finished.
    pub async fn receive(&self, msg: RoomMessage) {
        tokio::select! {
            _ = self.done.cancelled() => {
                tracing::debug!(room_id = %self.id, "Room closed, input dropped");
            }
            res = self.input.send(msg) => {
                if res.is_err() {
                    tracing::debug!(room_id = %self.id, "Input queue closed, input dropped");
                }
            }
        }
    }

    /// Returns the number of subscribed observers, or zero once finished.
    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.submit(RoomCommand::Count(tx)).await {
            rx.await.unwrap_or(0)
        } else {
            0
        }
    }

    /// Asks the room to close every observer and exit.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits until the room task has exited.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    /// Returns true once the room task has exited.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Returns true if both handles refer to the same room instance.
    pub fn same_room(&self, other: &Room) -> bool {
        Arc::ptr_eq(&self.id, &other.id)
    }

    async fn submit(&self, cmd: RoomCommand) -> bool {
        tokio::select! {
            _ = self.done.cancelled() => false,
            res = self.commands.send(cmd) => res.is_ok(),
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("done", &self.is_done())
            .finish()
    }
}

struct RoomState {
    id: String,
    conns: HashMap<String, Conn>,
    recent: VecDeque<RoomMessage>,
    replay_size: usize,
    online: BTreeMap<(String, String), MetaMessage>,
    bulk_transfer: bool,
}

impl RoomState {
    fn new(id: String, replay_size: usize) -> Self {
        Self {
            id,
            conns: HashMap::new(),
            recent: VecDeque::with_capacity(replay_size),
            replay_size,
            online: BTreeMap::new(),
            bulk_transfer: false,
        }
    }

    async fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Subscribe { conn, ack } => {
                self.catch_up(&conn).await;
                tracing::info!(room_id = %self.id, conn_id = %conn.id(), "Observer subscribed");
                self.conns.insert(conn.id().to_string(), conn);
                let _ = ack.send(());
            }
            RoomCommand::Unsubscribe { conn_id, ack } => {
                if self.conns.remove(&conn_id).is_some() {
                    tracing::info!(room_id = %self.id, conn_id = %conn_id, "Observer unsubscribed");
                }
                let _ = ack.send(());
            }
            RoomCommand::Broadcast(msg) => {
                self.record(&msg);
                self.fan_out(&msg).await;
            }
            RoomCommand::Count(reply) => {
                let _ = reply.send(self.conns.len());
            }
        }
    }

    /// Brings a new observer up to date: bulk-transfer marker, recent output,
    /// then the collaborator snapshot.
    async fn catch_up(&self, conn: &Conn) {
        if self.bulk_transfer {
            conn.handle_message(&RoomMessage::action(ZMODEM_START_EVENT))
                .await;
        }

        for msg in &self.recent {
            conn.handle_message(msg).await;
        }

        match serde_json::to_vec(&self.online_snapshot()) {
            Ok(body) => {
                conn.handle_message(&RoomMessage::new(EventKind::ShareUsers, body))
                    .await;
            }
            Err(e) => {
                tracing::warn!(room_id = %self.id, error = %e, "Failed to encode online users");
            }
        }
    }

    fn online_snapshot(&self) -> BTreeMap<String, &MetaMessage> {
        self.online
            .iter()
            .map(|((user, created), meta)| (format!("{}{}", user, created), meta))
            .collect()
    }

    fn record(&mut self, msg: &RoomMessage) {
        match msg.event {
            EventKind::Data => {
                if self.replay_size == 0 {
                    return;
                }
                if self.recent.len() == self.replay_size {
                    self.recent.pop_front();
                }
                self.recent.push_back(msg.clone());
            }
            EventKind::ShareJoin | EventKind::Join => {
                self.online.insert(msg.meta.online_key(), msg.meta.clone());
            }
            EventKind::ShareLeave | EventKind::Leave => {
                self.online.remove(&msg.meta.online_key());
            }
            EventKind::Action => {
                self.bulk_transfer = msg.is_bulk_transfer_start();
            }
            _ => {}
        }
    }

    async fn fan_out(&self, msg: &RoomMessage) {
        match self.conns.len() {
            0 => {}
            1 => {
                if let Some(conn) = self.conns.values().next() {
                    conn.handle_message(msg).await;
                }
            }
            _ => {
                let mut conns: Vec<&Conn> = self.conns.values().collect();
                conns.sort_by(|a, b| {
                    a.created_at()
                        .cmp(&b.created_at())
                        .then_with(|| a.id().cmp(b.id()))
                });
                join_all(conns.into_iter().map(|conn| conn.handle_message(msg))).await;
            }
        }
    }

    async fn close_all(&mut self) {
        for (_, conn) in self.conns.drain() {
            conn.close().await;
        }
    }
}

async fn run_room(
    mut state: RoomState,
    mut commands: mpsc::Receiver<RoomCommand>,
    idle_check: Duration,
    stop: CancellationToken,
    done: CancellationToken,
) {
    let mut idle = interval_at(Instant::now() + idle_check, idle_check);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!(room_id = %state.id, observers = state.conns.len(), "Room stopped");
                state.close_all().await;
                break;
            }
            _ = idle.tick() => {
                if state.conns.is_empty() {
                    tracing::info!(room_id = %state.id, "Room has no observers, exiting");
                    break;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(cmd) => state.handle(cmd).await,
                None => {
                    tracing::debug!(room_id = %state.id, "All room handles dropped");
                    break;
                }
            }
        }
    }

    done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingStream;
    use protocol::ZMODEM_END_EVENT;

    fn room() -> (Room, mpsc::Receiver<RoomMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (Room::create("room-1", tx, RoomOptions::default()), rx)
    }

    fn observer() -> (Conn, Arc<RecordingStream>) {
        let stream = Arc::new(RecordingStream::new());
        (Conn::new(stream.clone()), stream)
    }

    fn meta(user: &str, created: &str) -> MetaMessage {
        MetaMessage {
            user: user.to_string(),
            created: created.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_observer() {
        let (room, _rx) = room();
        let (a, a_stream) = observer();
        let (b, b_stream) = observer();
        room.subscribe(a).await;
        room.subscribe(b).await;

        room.broadcast(RoomMessage::data("ls\r\n")).await;
        assert_eq!(room.subscriber_count().await, 2);

        assert_eq!(a_stream.written(), b"ls\r\n");
        assert_eq!(b_stream.written(), b"ls\r\n");
    }

    #[tokio::test]
    async fn test_late_observer_gets_last_five_outputs() {
        let (room, _rx) = room();
        for chunk in ["1", "2", "3", "4", "5", "6", "7"] {
            room.broadcast(RoomMessage::data(chunk)).await;
        }

        let (late, stream) = observer();
        room.subscribe(late).await;

        assert_eq!(stream.written(), b"34567");
        let events = stream.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::ShareUsers);
        assert_eq!(events[0].body.as_ref(), b"{}");
    }

    #[tokio::test]
    async fn test_catch_up_during_bulk_transfer() {
        let (room, _rx) = room();
        for chunk in ["d1", "d2", "d3"] {
            room.broadcast(RoomMessage::data(chunk)).await;
        }
        room.broadcast(RoomMessage::action(ZMODEM_START_EVENT)).await;

        let (late, stream) = observer();
        room.subscribe(late).await;

        assert_eq!(
            stream.log(),
            vec![
                format!("E:Action:{}", ZMODEM_START_EVENT),
                "W:d1".to_string(),
                "W:d2".to_string(),
                "W:d3".to_string(),
                "E:Share_USERS:{}".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_bulk_transfer_end_clears_flag() {
        let (room, _rx) = room();
        room.broadcast(RoomMessage::action(ZMODEM_START_EVENT)).await;
        room.broadcast(RoomMessage::action(ZMODEM_END_EVENT)).await;

        let (late, stream) = observer();
        room.subscribe(late).await;

        let events = stream.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::ShareUsers);
    }

    #[tokio::test]
    async fn test_online_users_snapshot() {
        let (room, _rx) = room();
        let alice = meta("Alice(alice)", "2024-01-01 00:00:00");
        let bob = meta("Bob(bob)", "2024-01-01 00:01:00");

        room.broadcast(RoomMessage::new(EventKind::ShareJoin, "").with_meta(alice.clone()))
            .await;
        room.broadcast(RoomMessage::new(EventKind::ShareJoin, "").with_meta(bob.clone()))
            .await;
        room.broadcast(RoomMessage::new(EventKind::ShareLeave, "").with_meta(bob))
            .await;

        let (late, stream) = observer();
        room.subscribe(late).await;

        let events = stream.events();
        let users: serde_json::Value = serde_json::from_slice(&events[0].body).unwrap();
        let users = users.as_object().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(
            users["Alice(alice)2024-01-01 00:00:00"]["user"],
            "Alice(alice)"
        );
    }

    #[tokio::test]
    async fn test_same_user_twice_counts_twice() {
        let (room, _rx) = room();
        for created in ["t1", "t2"] {
            room.broadcast(
                RoomMessage::new(EventKind::Join, "").with_meta(meta("Alice(alice)", created)),
            )
            .await;
        }

        let (late, stream) = observer();
        room.subscribe(late).await;

        let users: serde_json::Value = serde_json::from_slice(&stream.events()[0].body).unwrap();
        assert_eq!(users.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribed_observer_gets_nothing_more() {
        let (room, _rx) = room();
        let (a, a_stream) = observer();
        room.subscribe(a.clone()).await;

        room.broadcast(RoomMessage::data("one")).await;
        room.unsubscribe(&a).await;
        room.broadcast(RoomMessage::data("two")).await;
        assert_eq!(room.subscriber_count().await, 0);

        assert_eq!(a_stream.written(), b"one");
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_observer_is_noop() {
        let (room, _rx) = room();
        let (a, _) = observer();
        let (stranger, _) = observer();
        room.subscribe(a).await;

        room.unsubscribe(&stranger).await;

        assert_eq!(room.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_failing_observer_does_not_block_others() {
        let (room, _rx) = room();
        let broken = Conn::new(Arc::new(RecordingStream::failing()));
        let (ok, ok_stream) = observer();
        room.subscribe(broken).await;
        room.subscribe(ok).await;

        room.broadcast(RoomMessage::data("x")).await;
        room.broadcast(RoomMessage::data("y")).await;
        assert_eq!(room.subscriber_count().await, 2);

        assert_eq!(ok_stream.written(), b"xy");
    }

    #[tokio::test]
    async fn test_receive_forwards_to_input_queue() {
        let (room, mut rx) = room();
        let msg = RoomMessage::data("whoami\r").with_meta(meta("Alice(alice)", "t"));

        room.receive(msg.clone()).await;

        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("timeout")
            .expect("input closed");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_stop_closes_observers_and_finishes() {
        let (room, _rx) = room();
        let (a, a_stream) = observer();
        room.subscribe(a).await;

        room.stop();
        tokio::time::timeout(Duration::from_millis(100), room.done())
            .await
            .expect("room did not finish");

        assert!(room.is_done());
        assert!(a_stream.is_closed());

        let (late, late_stream) = observer();
        room.subscribe(late).await;
        room.broadcast(RoomMessage::data("ignored")).await;
        assert!(late_stream.written().is_empty());
        assert_eq!(room.subscriber_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_exits_on_idle_check() {
        let (room, _rx) = room();

        tokio::time::sleep(DEFAULT_IDLE_CHECK + Duration::from_secs(1)).await;

        assert!(room.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_occupied_room_survives_idle_check() {
        let (room, _rx) = room();
        let (a, _) = observer();
        room.subscribe(a).await;

        tokio::time::sleep(DEFAULT_IDLE_CHECK * 3).await;

        assert!(!room.is_done());
    }

    #[tokio::test]
    async fn test_replay_disabled() {
        let (tx, _rx) = mpsc::channel(1);
        let room = Room::create(
            "quiet",
            tx,
            RoomOptions {
                replay_size: 0,
                ..Default::default()
            },
        );
        room.broadcast(RoomMessage::data("secret")).await;

        let (late, stream) = observer();
        room.subscribe(late).await;

        assert!(stream.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_idle_check_uses_default_period() {
        let (tx, _rx) = mpsc::channel(1);
        let room = Room::create(
            "zero",
            tx,
            RoomOptions {
                idle_check: Duration::ZERO,
                ..Default::default()
            },
        );

        tokio::time::sleep(DEFAULT_IDLE_CHECK - Duration::from_secs(1)).await;
        assert!(!room.is_done());
        assert_eq!(room.subscriber_count().await, 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(room.is_done());
    }

    #[tokio::test]
    async fn test_observer_count_tracks_subscriptions() {
        let (room, _rx) = room();
        let mut conns = Vec::new();
        for _ in 0..6 {
            let (conn, _) = observer();
            room.subscribe(conn.clone()).await;
            conns.push(conn);
        }
        for conn in conns.iter().take(4) {
            room.unsubscribe(conn).await;
        }
        // repeated unsubscribe must not go negative
        room.unsubscribe(&conns[0]).await;

        assert_eq!(room.subscriber_count().await, 2);
    }
}
