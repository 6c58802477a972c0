//! Bridging of one front-end connection to one backend shell.
//!
//! A [`SwitchSession`] owns the session's room for the duration of
//! [`SwitchSession::bridge`]. The bridge runs a single control loop that
//! multiplexes terminal traffic in both directions, window changes, policy
//! checks, keepalives and administrative notices, and tears everything down
//! in a fixed order when any of them ends the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use protocol::{EventKind, MetaMessage, RoomMessage, TaskName, TerminalTask, WindowSize};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use super::connection::{ServerConnection, UserConnection, UserStream};
use super::demux::StreamDemux;
use super::pump::{spawn_backend_pump, spawn_frontend_pump};
use super::tracker::{TaskError, TaskHandler};
use crate::exchange::{Conn, Room, RoomOptions, RoomRegistry};
use crate::term;

/// Period of policy checks.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Idle period after which the backend transport is exercised.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Idle period after which a session is closed.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60 * 60);

/// Absolute session lifetime.
pub const DEFAULT_MAX_SESSION_TIME: Duration = Duration::from_secs(24 * 60 * 60);

const NOTIFY_QUEUE_SIZE: usize = 8;
const INPUT_QUEUE_SIZE: usize = 1;
const BACKEND_QUEUE_SIZE: usize = 1;

/// When the user's permission to the asset runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireInfo {
    /// Expiry instant, `None` for permissions that never expire.
    pub expired_at: Option<DateTime<Utc>>,
}

impl ExpireInfo {
    /// Permission that never expires.
    pub fn never() -> Self {
        Self::default()
    }

    /// Permission expiring at the given instant.
    pub fn at(expired_at: DateTime<Utc>) -> Self {
        Self {
            expired_at: Some(expired_at),
        }
    }

    /// Returns true if the permission has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|at| now >= at)
    }
}

/// Limits and timings of a bridged session.
#[derive(Debug, Clone)]
pub struct SwitchOptions {
    /// Idle period after which the session is closed.
    pub max_idle: Duration,
    /// Absolute lifetime of the session.
    pub max_session_time: Duration,
    /// Policy check period.
    pub heartbeat: Duration,
    /// Backend keepalive period.
    pub keepalive: Duration,
    /// Permission expiry.
    pub expire: ExpireInfo,
    /// Options of the session's room.
    pub room: RoomOptions,
}

impl Default for SwitchOptions {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            max_session_time: DEFAULT_MAX_SESSION_TIME,
            heartbeat: DEFAULT_HEARTBEAT,
            keepalive: DEFAULT_KEEPALIVE,
            expire: ExpireInfo::never(),
            room: RoomOptions::default(),
        }
    }
}

impl SwitchOptions {
    /// Replaces zero timer periods with their defaults.
    fn with_timer_defaults(mut self, session_id: &str) -> Self {
        if self.heartbeat.is_zero() {
            tracing::warn!(session_id, "Zero heartbeat period, using default");
            self.heartbeat = DEFAULT_HEARTBEAT;
        }
        if self.keepalive.is_zero() {
            tracing::warn!(session_id, "Zero keepalive period, using default");
            self.keepalive = DEFAULT_KEEPALIVE;
        }
        self
    }
}

/// The user owning a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUser {
    /// Login name.
    pub id: String,
    /// Display string, `Name(username)`.
    pub display: String,
}

/// Errors from misusing a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `bridge` was called a second time.
    #[error("session {0} is already bridged")]
    AlreadyBridged(String),
}

/// Why a bridged session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The absolute lifetime elapsed.
    MaxSessionTime,
    /// No activity for longer than the idle limit.
    IdleTimeout,
    /// The user's permission expired.
    PermissionExpired,
    /// An administrator terminated the session.
    Terminated {
        /// Who terminated it.
        operator: String,
    },
    /// The backend shell went away.
    BackendClosed,
    /// The front-end connection went away.
    FrontendClosed,
    /// The front-end stopped reporting window changes.
    WindowClosed,
}

#[derive(Serialize)]
struct OperatorNotice<'a> {
    user: &'a str,
}

struct BridgeChannels {
    user_out: mpsc::Receiver<Bytes>,
    srv_out: mpsc::Receiver<Bytes>,
    exit: mpsc::Receiver<()>,
    notify: mpsc::Receiver<RoomMessage>,
    windows: mpsc::Receiver<WindowSize>,
}

/// One proxied session between a user and a container shell.
pub struct SwitchSession {
    id: String,
    user: SessionUser,
    options: SwitchOptions,
    rooms: Arc<RoomRegistry>,
    cancel: CancellationToken,
    terminating: AtomicBool,
    paused: AtomicBool,
    operator: ArcSwapOption<String>,
    notify_tx: mpsc::Sender<RoomMessage>,
    notify_rx: Mutex<Option<mpsc::Receiver<RoomMessage>>>,
}

impl SwitchSession {
    /// Creates a session that has not been bridged yet.
    ///
    /// Zero heartbeat or keepalive periods fall back to
    /// [`DEFAULT_HEARTBEAT`] and [`DEFAULT_KEEPALIVE`].
    pub fn new(
        id: impl Into<String>,
        user: SessionUser,
        options: SwitchOptions,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        let id = id.into();
        let options = options.with_timer_defaults(&id);
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_SIZE);
        Self {
            id,
            user,
            options,
            rooms,
            cancel: CancellationToken::new(),
            terminating: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            operator: ArcSwapOption::empty(),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true while an administrator has the session paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns true once the session has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Administrator who last acted on the session.
    pub fn current_operator(&self) -> Option<String> {
        self.operator.load_full().map(|op| op.as_ref().clone())
    }

    /// Terminates the session. Only the first call has any effect.
    pub fn terminate(&self, operator: &str) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_id = %self.id, operator, "Session already terminating");
            return;
        }
        self.set_operator(operator);
        self.cancel.cancel();
        tracing::info!(session_id = %self.id, operator, "Session terminated by admin");
    }

    /// Marks the session paused and notifies every observer.
    pub async fn pause_operation(&self, operator: &str) {
        self.paused.store(true, Ordering::SeqCst);
        self.set_operator(operator);
        tracing::info!(session_id = %self.id, operator, "Session paused");
        self.notify(EventKind::Pause, operator).await;
    }

    /// Clears the paused mark and notifies every observer.
    pub async fn resume_operation(&self, operator: &str) {
        self.paused.store(false, Ordering::SeqCst);
        self.set_operator(operator);
        tracing::info!(session_id = %self.id, operator, "Session resumed");
        self.notify(EventKind::Resume, operator).await;
    }

    fn set_operator(&self, operator: &str) {
        self.operator.store(Some(Arc::new(operator.to_string())));
    }

    async fn notify(&self, event: EventKind, operator: &str) {
        let body = match serde_json::to_vec(&OperatorNotice { user: operator }) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to encode notice");
                return;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(session_id = %self.id, %event, "Session ended, notice dropped");
            }
            res = self.notify_tx.send(RoomMessage::new(event, body)) => {
                if res.is_err() {
                    tracing::debug!(session_id = %self.id, %event, "Bridge not running, notice dropped");
                }
            }
        }
    }

    /// Connects a front-end to a backend and runs the session to its end.
    ///
    /// Both connections are closed when this returns. Returns an error only
    /// if the session was bridged before.
    pub async fn bridge(
        &self,
        user_conn: Arc<dyn UserConnection>,
        srv_conn: Arc<dyn ServerConnection>,
    ) -> Result<SessionExit, SessionError> {
        let notify = self
            .notify_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::AlreadyBridged(self.id.clone()))?;

        let closed = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_SIZE);
        let (srv_tx, srv_rx) = mpsc::channel(BACKEND_QUEUE_SIZE);
        let StreamDemux { user_out, srv_out } = StreamDemux::spawn(input_rx, srv_rx, closed.clone());

        let room = Room::create(self.id.clone(), input_tx, self.options.room);
        self.rooms.register(room.clone());
        let conn = Conn::new(Arc::new(UserStream(user_conn.clone())));
        room.subscribe(conn.clone()).await;

        let meta = MetaMessage {
            user_id: self.user.id.clone(),
            user: self.user.display.clone(),
            created: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            remote_addr: user_conn.remote_addr().to_string(),
            terminal_id: user_conn.id().to_string(),
            primary: true,
            writable: true,
        };

        let (exit_tx, exit) = mpsc::channel(1);
        spawn_backend_pump(self.id.clone(), srv_conn.clone(), srv_tx, closed.clone());
        room.broadcast(RoomMessage::new(EventKind::ShareJoin, Bytes::new()).with_meta(meta.clone()))
            .await;
        spawn_frontend_pump(
            self.id.clone(),
            user_conn.clone(),
            room.clone(),
            meta.clone(),
            closed.clone(),
            exit_tx,
        );

        // A front-end without window reporting keeps its sender alive here
        // so the stream never looks closed.
        let (_window_guard, windows) = match user_conn.take_window_changes() {
            Some(rx) => (None, rx),
            None => {
                let (tx, rx) = mpsc::channel(1);
                (Some(tx), rx)
            }
        };

        tracing::info!(session_id = %self.id, user = %self.user.display, "Session bridge started");

        let channels = BridgeChannels {
            user_out,
            srv_out,
            exit,
            notify,
            windows,
        };
        let reason = self
            .run(&room, user_conn.as_ref(), srv_conn.as_ref(), channels)
            .await;

        tracing::info!(session_id = %self.id, reason = ?reason, "Session bridge finished");

        room.broadcast(RoomMessage::new(EventKind::ShareLeave, Bytes::new()).with_meta(meta))
            .await;
        room.unsubscribe(&conn).await;
        self.rooms.unregister(&room);
        room.stop();
        closed.cancel();

        if let Err(e) = user_conn.close().await {
            tracing::debug!(session_id = %self.id, error = %e, "User connection close failed");
        }
        if let Err(e) = srv_conn.close().await {
            tracing::debug!(session_id = %self.id, error = %e, "Backend connection close failed");
        }

        Ok(reason)
    }

    async fn run(
        &self,
        room: &Room,
        user_conn: &dyn UserConnection,
        srv_conn: &dyn ServerConnection,
        mut ch: BridgeChannels,
    ) -> SessionExit {
        let started = Instant::now();
        let deadline = started + self.options.max_session_time;
        let mut heartbeat = interval_at(started + self.options.heartbeat, self.options.heartbeat);
        let mut keepalive = interval_at(started + self.options.keepalive, self.options.keepalive);
        let lifecycle = user_conn.lifecycle();
        let mut last_active = started;

        loop {
            tokio::select! {
                now = heartbeat.tick() => {
                    if let Some((exit, msg)) = self.check_policy(now, deadline, last_active) {
                        tracing::info!(session_id = %self.id, reason = ?exit, "Session closed by policy");
                        self.warn_room(room, &msg).await;
                        return exit;
                    }
                    continue;
                }
                _ = self.cancel.cancelled() => {
                    let operator = self.current_operator().unwrap_or_default();
                    self.warn_room(room, &format!("Terminated by admin {}", operator)).await;
                    return SessionExit::Terminated { operator };
                }
                size = ch.windows.recv() => match size {
                    Some(size) => {
                        if let Err(e) = srv_conn.set_win_size(size).await {
                            tracing::warn!(session_id = %self.id, error = %e, "Backend resize failed");
                        }
                        tracing::debug!(session_id = %self.id, width = size.width, height = size.height, "Window changed");
                        match serde_json::to_vec(&size) {
                            Ok(body) => room.broadcast(RoomMessage::new(EventKind::Windows, body)).await,
                            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "Failed to encode window"),
                        }
                    }
                    None => {
                        tracing::info!(session_id = %self.id, "Window channel closed");
                        return SessionExit::WindowClosed;
                    }
                },
                data = ch.srv_out.recv() => match data {
                    Some(data) => room.broadcast(RoomMessage::data(data)).await,
                    None => return SessionExit::BackendClosed,
                },
                data = ch.user_out.recv() => match data {
                    Some(data) => {
                        if let Err(e) = srv_conn.write(&data).await {
                            tracing::error!(session_id = %self.id, error = %e, "Backend write failed");
                        }
                    }
                    None => return SessionExit::FrontendClosed,
                },
                now = keepalive.tick() => {
                    if now.duration_since(last_active) > self.options.keepalive {
                        if let Err(e) = srv_conn.keep_alive().await {
                            tracing::error!(session_id = %self.id, error = %e, "Backend keepalive failed");
                        }
                    }
                    continue;
                }
                _ = lifecycle.cancelled() => {
                    tracing::info!(session_id = %self.id, "User connection closed");
                    return SessionExit::FrontendClosed;
                }
                _ = ch.exit.recv() => {
                    tracing::info!(session_id = %self.id, "User read loop exited");
                    return SessionExit::FrontendClosed;
                }
                Some(msg) = ch.notify.recv() => {
                    tracing::info!(session_id = %self.id, event = %msg.event, "Broadcasting admin notice");
                    room.broadcast(msg).await;
                    continue;
                }
            }
            last_active = Instant::now();
        }
    }

    fn check_policy(
        &self,
        now: Instant,
        deadline: Instant,
        last_active: Instant,
    ) -> Option<(SessionExit, String)> {
        if now >= deadline {
            return Some((
                SessionExit::MaxSessionTime,
                "Session max time reached, disconnect".to_string(),
            ));
        }
        if now.duration_since(last_active) > self.options.max_idle {
            let minutes = self.options.max_idle.as_secs() / 60;
            return Some((
                SessionExit::IdleTimeout,
                format!("Connect idle more than {} minutes, disconnect", minutes),
            ));
        }
        if self.options.expire.is_expired(Utc::now()) {
            return Some((
                SessionExit::PermissionExpired,
                "Permission has expired, disconnect".to_string(),
            ));
        }
        None
    }

    async fn warn_room(&self, room: &Room, msg: &str) {
        room.broadcast(RoomMessage::data(term::warning_line(msg)))
            .await;
    }
}

impl TaskHandler for SwitchSession {
    fn handle_task<'a>(&'a self, task: TerminalTask) -> BoxFuture<'a, Result<(), TaskError>> {
        Box::pin(async move {
            match task.name {
                TaskName::KillSession => self.terminate(&task.kwargs.terminated_by),
                TaskName::LockSession => self.pause_operation(&task.kwargs.created_by_user).await,
                TaskName::UnlockSession => {
                    self.resume_operation(&task.kwargs.created_by_user)
                        .await
                }
                TaskName::Unknown => {
                    return Err(TaskError::UnknownTask {
                        session_id: self.id.clone(),
                    })
                }
            }
            Ok(())
        })
    }
}
