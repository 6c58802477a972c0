//! Front-end over the gateway process's own terminal.

use std::io;
use std::sync::{Mutex as StdMutex, PoisonError};

use futures_util::future::BoxFuture;
use protocol::{EventKind, Pty, RoomMessage, WindowSize};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdin, Stdout};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::UserConnection;

/// Puts the controlling terminal in raw mode until dropped.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Enables raw mode.
    pub fn enable() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

#[derive(Deserialize)]
struct OperatorNotice {
    #[serde(default)]
    user: String,
}

/// The local terminal as a user connection.
pub struct StdioConnection {
    id: String,
    stdin: Mutex<Stdin>,
    stdout: Mutex<Stdout>,
    windows: StdMutex<Option<mpsc::Receiver<WindowSize>>>,
    lifecycle: CancellationToken,
    pty: Pty,
}

impl StdioConnection {
    /// Wraps stdin and stdout. Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        let lifecycle = CancellationToken::new();
        let window = crossterm::terminal::size()
            .map(|(cols, rows)| WindowSize::new(cols, rows))
            .unwrap_or_default();
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string());

        Self {
            id: Uuid::new_v4().to_string(),
            stdin: Mutex::new(tokio::io::stdin()),
            stdout: Mutex::new(tokio::io::stdout()),
            windows: StdMutex::new(watch_window(lifecycle.clone())),
            lifecycle,
            pty: Pty { term, window },
        }
    }
}

/// Reports window changes signalled by SIGWINCH.
#[cfg(unix)]
fn watch_window(lifecycle: CancellationToken) -> Option<mpsc::Receiver<WindowSize>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigwinch = match signal(SignalKind::window_change()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot watch terminal size");
            return None;
        }
    };

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => break,
                sig = sigwinch.recv() => {
                    if sig.is_none() {
                        break;
                    }
                    if let Ok((cols, rows)) = crossterm::terminal::size() {
                        if tx.send(WindowSize::new(cols, rows)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    Some(rx)
}

#[cfg(not(unix))]
fn watch_window(_lifecycle: CancellationToken) -> Option<mpsc::Receiver<WindowSize>> {
    None
}

impl Default for StdioConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl UserConnection for StdioConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move { self.stdin.lock().await.read(buf).await })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut stdout = self.stdout.lock().await;
            stdout.write_all(data).await?;
            stdout.flush().await?;
            Ok(data.len())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.lifecycle.cancel();
            self.stdout.lock().await.flush().await
        })
    }

    fn take_window_changes(&self) -> Option<mpsc::Receiver<WindowSize>> {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn login_from(&self) -> &str {
        "ST"
    }

    fn remote_addr(&self) -> &str {
        "local"
    }

    fn pty(&self) -> Pty {
        self.pty.clone()
    }

    fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.clone()
    }

    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let verb = match msg.event {
                EventKind::Pause => "paused",
                EventKind::Resume => "resumed",
                _ => {
                    tracing::trace!(conn_id = %self.id, event = %msg.event, "Room event");
                    return;
                }
            };

            let operator = serde_json::from_slice::<OperatorNotice>(&msg.body)
                .map(|n| n.user)
                .unwrap_or_default();
            let notice = format!("\r\n[session {} by {}]\r\n", verb, operator);
            if let Err(e) = self.write(notice.as_bytes()).await {
                tracing::debug!(conn_id = %self.id, error = %e, "Failed to show notice");
            }
        })
    }
}
