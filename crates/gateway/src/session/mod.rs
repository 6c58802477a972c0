//! Session bridging.
//!
//! This module connects a user's terminal to a container shell and keeps the
//! session's room fed while it runs.
//!
//! - [`connection`]: Front-end and backend connection traits
//! - [`demux`]: Splits inbound traffic into byte streams
//! - [`pump`]: Read loops for both connections
//! - [`switch`]: The bridge itself and its administrative controls
//! - [`tracker`]: Live session tracking and task dispatch

pub mod connection;
pub mod demux;
pub mod pump;
pub mod switch;
pub mod tracker;

pub use connection::{
    ConnectError, ContainerInfo, ServerConnection, ServerConnectionFactory, UserConnection,
};
pub use demux::StreamDemux;
pub use pump::{split_at_carriage_return, Utf8Accumulator, LINE_SPLIT_DELAY, READ_CHUNK_SIZE};
pub use switch::{
    ExpireInfo, SessionError, SessionExit, SessionUser, SwitchOptions, SwitchSession,
    DEFAULT_HEARTBEAT, DEFAULT_KEEPALIVE, DEFAULT_MAX_IDLE, DEFAULT_MAX_SESSION_TIME,
};
pub use tracker::{SessionRegistry, TaskError, TaskHandler, TaskTracker, TrackedSession};
