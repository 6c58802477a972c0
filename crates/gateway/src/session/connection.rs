//! Connection abstractions at both ends of a session.
//!
//! The front-end is whatever the user typed into (an SSH channel, a web
//! terminal, the local console). The backend is the container shell. Both
//! are shared between several tasks, so every operation takes `&self` and
//! implementations keep their read and write halves behind separate locks.

use std::fmt;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use protocol::{Pty, RoomMessage, WindowSize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::exchange::RoomStream;

/// Front-end side of a session.
pub trait UserConnection: Send + Sync {
    /// Identifier of the connection.
    fn id(&self) -> &str;

    /// Reads user keystrokes. `Ok(0)` means the user went away.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Writes terminal output to the user.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Closes the connection.
    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>>;

    /// Takes the stream of window-size changes.
    ///
    /// Returns `None` if the stream was already taken or the front-end never
    /// reports changes. The stream ending means the front-end is gone.
    fn take_window_changes(&self) -> Option<mpsc::Receiver<WindowSize>>;

    /// Label of the channel the user logged in from.
    fn login_from(&self) -> &str;

    /// Remote address of the user.
    fn remote_addr(&self) -> &str;

    /// Terminal requested by the user.
    fn pty(&self) -> Pty;

    /// Cancelled when the front-end connection ends on its own.
    fn lifecycle(&self) -> CancellationToken;

    /// Delivers a non-data room event to the user.
    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()>;
}

/// Backend side of a session.
pub trait ServerConnection: Send + Sync {
    /// Reads shell output. `Ok(0)` means the shell went away.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Writes user input to the shell.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>>;

    /// Closes the shell.
    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>>;

    /// Resizes the remote terminal.
    fn set_win_size<'a>(&'a self, size: WindowSize) -> BoxFuture<'a, io::Result<()>>;

    /// Exercises the transport so intermediaries keep it open.
    fn keep_alive<'a>(&'a self) -> BoxFuture<'a, io::Result<()>>;
}

/// Identity of a container shell target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Cluster name.
    pub cluster: String,
    /// Namespace.
    pub namespace: String,
    /// Pod name.
    pub pod: String,
    /// Container name, empty for the pod's default container.
    pub container: String,
}

impl fmt::Display for ContainerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.cluster, self.namespace, self.pod, self.container
        )
    }
}

/// Errors opening a backend connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The target does not exist or cannot be reached.
    #[error("target unreachable: {0}")]
    Unreachable(String),

    /// The target refused the credentials.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The shell could not be started.
    #[error("failed to start shell: {0}")]
    Spawn(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Opens backend connections.
pub trait ServerConnectionFactory: Send + Sync {
    /// Opens a shell on the target with the given initial window.
    fn connect<'a>(
        &'a self,
        target: &'a ContainerInfo,
        window: WindowSize,
    ) -> BoxFuture<'a, Result<Arc<dyn ServerConnection>, ConnectError>>;
}

/// Adapts a front-end connection into a room observer stream.
pub(crate) struct UserStream(pub(crate) Arc<dyn UserConnection>);

impl RoomStream for UserStream {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        self.0.write(data)
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        self.0.close()
    }

    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()> {
        self.0.handle_room_event(msg)
    }
}
