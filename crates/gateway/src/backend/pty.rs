//! Local pseudo-terminal backend.
//!
//! Spawns a shell in a PTY on the gateway host. This stands in for the
//! container exec stream when running the gateway against a workstation and
//! in tests of the full engine.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures_util::future::BoxFuture;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::WindowSize;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::session::{ConnectError, ContainerInfo, ServerConnection, ServerConnectionFactory};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the reader task and `read` callers.
const OUTPUT_QUEUE_SIZE: usize = 64;

type SharedWriter = Arc<StdMutex<Box<dyn Write + Send>>>;

struct ReadState {
    output: mpsc::Receiver<io::Result<Vec<u8>>>,
    leftover: Vec<u8>,
}

/// A shell running in a local PTY.
pub struct PtyConnection {
    id: String,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Option<SharedWriter>>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    reader: Mutex<ReadState>,
    closed: AtomicBool,
}

impl PtyConnection {
    /// Spawns `shell` in a new PTY of the given size.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        shell: &str,
        window: WindowSize,
        env: Vec<(String, String)>,
    ) -> Result<Self, ConnectError> {
        let id = Uuid::new_v4().to_string();

        let pair = native_pty_system()
            .openpty(pty_size(window))
            .map_err(|e| ConnectError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ConnectError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ConnectError::Spawn(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ConnectError::Spawn(e.to_string()))?;

        let (tx, output) = mpsc::channel(OUTPUT_QUEUE_SIZE);
        spawn_read_loop(id.clone(), reader, tx);

        tracing::info!(
            conn_id = %id,
            shell,
            pid = ?child.process_id(),
            width = window.width,
            height = window.height,
            "Spawned PTY shell"
        );

        Ok(Self {
            id,
            master: StdMutex::new(pair.master),
            writer: Mutex::new(Some(Arc::new(StdMutex::new(writer)))),
            child: StdMutex::new(child),
            reader: Mutex::new(ReadState {
                output,
                leftover: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true once the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn pty_size(window: WindowSize) -> PtySize {
    PtySize {
        rows: window.height,
        cols: window.width,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Moves blocking PTY reads onto the blocking pool for the life of the shell.
fn spawn_read_loop(
    conn_id: String,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<io::Result<Vec<u8>>>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(conn_id = %conn_id, "PTY EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(Ok(buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // Linux reports EIO once the slave side has gone away.
                    let _ = tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });
}

impl ServerConnection for PtyConnection {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let mut state = self.reader.lock().await;
            if state.leftover.is_empty() {
                match state.output.recv().await {
                    Some(Ok(chunk)) => state.leftover = chunk,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(0),
                }
            }

            let n = state.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&state.leftover[..n]);
            state.leftover.drain(..n);
            Ok(n)
        })
    }

    /// Writes on the blocking pool. The async lock is held until the
    /// blocking write returns, so concurrent writes keep their order.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let slot = self.writer.lock().await;
            let writer = slot
                .as_ref()
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "PTY closed"))?
                .clone();
            let chunk = data.to_vec();

            tokio::task::spawn_blocking(move || {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                writer.write_all(&chunk)?;
                writer.flush()
            })
            .await
            .map_err(io::Error::other)??;

            drop(slot);
            Ok(data.len())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }

            self.writer.lock().await.take();
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    tracing::debug!(conn_id = %self.id, error = %e, "Failed to kill PTY shell");
                }
            }
            tracing::info!(conn_id = %self.id, "PTY connection closed");
            Ok(())
        })
    }

    fn set_win_size<'a>(&'a self, size: WindowSize) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.master
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .resize(pty_size(size))
                .map_err(io::Error::other)?;
            tracing::debug!(conn_id = %self.id, cols = size.width, rows = size.height, "Resized PTY");
            Ok(())
        })
    }

    fn keep_alive<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            match child.try_wait()? {
                Some(status) => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("shell exited with code {}", status.exit_code()),
                )),
                None => Ok(()),
            }
        })
    }
}

/// Opens local PTY shells for any target.
///
/// The target is exposed to the shell through `KUBEJUMP_*` environment
/// variables so prompts and scripts can show what was requested.
pub struct PtyConnectionFactory {
    shell: String,
}

impl PtyConnectionFactory {
    /// Creates a factory starting `shell`.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ServerConnectionFactory for PtyConnectionFactory {
    fn connect<'a>(
        &'a self,
        target: &'a ContainerInfo,
        window: WindowSize,
    ) -> BoxFuture<'a, Result<Arc<dyn ServerConnection>, ConnectError>> {
        Box::pin(async move {
            let env = vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("KUBEJUMP_TARGET".to_string(), target.to_string()),
                ("KUBEJUMP_NAMESPACE".to_string(), target.namespace.clone()),
                ("KUBEJUMP_POD".to_string(), target.pod.clone()),
            ];
            let conn = PtyConnection::spawn(&self.shell, window, env)?;
            Ok(Arc::new(conn) as Arc<dyn ServerConnection>)
        })
    }
}
