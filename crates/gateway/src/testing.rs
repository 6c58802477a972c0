//! In-memory connections shared by unit tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use protocol::{Pty, RoomMessage, WindowSize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::exchange::RoomStream;
use crate::session::{
    ConnectError, ContainerInfo, ServerConnection, ServerConnectionFactory, UserConnection,
};

/// Room stream that records what it receives.
pub(crate) struct RecordingStream {
    written: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    events: Mutex<Vec<RoomMessage>>,
    log: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_writes: bool,
}

impl RecordingStream {
    pub(crate) fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_writes: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::new()
        }
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<RoomMessage> {
        self.events.lock().unwrap().clone()
    }

    /// Writes and events in arrival order, as `W:<text>` and
    /// `E:<event>:<body>`.
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl RoomStream for RecordingStream {
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "observer gone"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.written.lock().unwrap().extend_from_slice(data);
            self.log
                .lock()
                .unwrap()
                .push(format!("W:{}", String::from_utf8_lossy(data)));
            Ok(data.len())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!(
                "E:{}:{}",
                msg.event,
                String::from_utf8_lossy(&msg.body)
            ));
            self.events.lock().unwrap().push(msg.clone());
        })
    }
}

/// Front-end connection fed from the test.
pub(crate) struct MockUserConnection {
    id: String,
    input_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    input_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    output: Mutex<Vec<u8>>,
    events: Mutex<Vec<RoomMessage>>,
    window_tx: Mutex<Option<mpsc::Sender<WindowSize>>>,
    window_rx: Mutex<Option<mpsc::Receiver<WindowSize>>>,
    lifecycle: CancellationToken,
    closed: AtomicBool,
    window: WindowSize,
}

impl MockUserConnection {
    pub(crate) fn new() -> Self {
        Self::with_window(WindowSize::new(100, 30))
    }

    pub(crate) fn with_window(window: WindowSize) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (window_tx, window_rx) = mpsc::channel(4);
        Self {
            id: "user-conn-1".to_string(),
            input_tx: Mutex::new(Some(input_tx)),
            input_rx: tokio::sync::Mutex::new(input_rx),
            output: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            window_tx: Mutex::new(Some(window_tx)),
            window_rx: Mutex::new(Some(window_rx)),
            lifecycle: CancellationToken::new(),
            closed: AtomicBool::new(false),
            window,
        }
    }

    pub(crate) fn push_input(&self, data: &[u8]) {
        if let Some(tx) = self.input_tx.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    pub(crate) fn finish_input(&self) {
        self.input_tx.lock().unwrap().take();
    }

    pub(crate) async fn resize(&self, size: WindowSize) {
        let tx = self.window_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(size).await;
        }
    }

    pub(crate) fn close_windows(&self) {
        self.window_tx.lock().unwrap().take();
    }

    pub(crate) fn output(&self) -> Vec<u8> {
        self.output.lock().unwrap().clone()
    }

    pub(crate) fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    pub(crate) fn events(&self) -> Vec<RoomMessage> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn hang_up(&self) {
        self.lifecycle.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl UserConnection for MockUserConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            match self.input_rx.lock().await.recv().await {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            self.output.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.input_tx.lock().unwrap().take();
            Ok(())
        })
    }

    fn take_window_changes(&self) -> Option<mpsc::Receiver<WindowSize>> {
        self.window_rx.lock().unwrap().take()
    }

    fn login_from(&self) -> &str {
        "ST"
    }

    fn remote_addr(&self) -> &str {
        "10.0.0.9:50022"
    }

    fn pty(&self) -> Pty {
        Pty {
            term: "xterm".to_string(),
            window: self.window,
        }
    }

    fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.clone()
    }

    fn handle_room_event<'a>(&'a self, msg: &'a RoomMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.events.lock().unwrap().push(msg.clone());
        })
    }
}

/// Backend connection fed from the test.
pub(crate) struct MockServerConnection {
    output_tx: Mutex<Option<mpsc::UnboundedSender<io::Result<Vec<u8>>>>>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
    input: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<WindowSize>>,
    keepalives: AtomicUsize,
    closed: AtomicBool,
}

impl MockServerConnection {
    pub(crate) fn new() -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: tokio::sync::Mutex::new(output_rx),
            input: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            keepalives: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn push_output(&self, data: &[u8]) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Ok(data.to_vec()));
        }
    }

    pub(crate) fn push_error(&self) {
        if let Some(tx) = self.output_tx.lock().unwrap().as_ref() {
            let _ = tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        }
    }

    pub(crate) fn finish_output(&self) {
        self.output_tx.lock().unwrap().take();
    }

    pub(crate) fn input(&self) -> Vec<u8> {
        self.input.lock().unwrap().clone()
    }

    pub(crate) fn sizes(&self) -> Vec<WindowSize> {
        self.sizes.lock().unwrap().clone()
    }

    pub(crate) fn keepalive_count(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ServerConnection for MockServerConnection {
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            match self.output_rx.lock().await.recv().await {
                Some(Ok(chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            self.input.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.output_tx.lock().unwrap().take();
            Ok(())
        })
    }

    fn set_win_size<'a>(&'a self, size: WindowSize) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.sizes.lock().unwrap().push(size);
            Ok(())
        })
    }

    fn keep_alive<'a>(&'a self) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Factory handing out a prepared backend, or failing.
pub(crate) struct MockFactory {
    conn: Option<Arc<MockServerConnection>>,
    connects: AtomicUsize,
    last_window: Mutex<Option<WindowSize>>,
}

impl MockFactory {
    pub(crate) fn serving(conn: Arc<MockServerConnection>) -> Self {
        Self {
            conn: Some(conn),
            connects: AtomicUsize::new(0),
            last_window: Mutex::new(None),
        }
    }

    pub(crate) fn unreachable() -> Self {
        Self {
            conn: None,
            connects: AtomicUsize::new(0),
            last_window: Mutex::new(None),
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn last_window(&self) -> Option<WindowSize> {
        *self.last_window.lock().unwrap()
    }
}

impl ServerConnectionFactory for MockFactory {
    fn connect<'a>(
        &'a self,
        target: &'a ContainerInfo,
        window: WindowSize,
    ) -> BoxFuture<'a, Result<Arc<dyn ServerConnection>, ConnectError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.last_window.lock().unwrap() = Some(window);
            match &self.conn {
                Some(conn) => Ok(conn.clone() as Arc<dyn ServerConnection>),
                None => Err(ConnectError::Unreachable(format!("pod {} not found", target.pod))),
            }
        })
    }
}
