//! Room exchange.
//!
//! Every bridged session owns a [`Room`]: a broadcast hub that fans terminal
//! output and session events out to its observers (the owner plus any
//! collaborators or monitors) and funnels observer input back to the
//! session.
//!
//! - [`conn`]: Observer handles and the stream trait they write to
//! - [`room`]: The room task and its handle
//! - [`registry`]: Process-wide room lookup
//! - [`relay`]: Publishing rooms to other gateway instances

pub mod conn;
pub mod registry;
pub mod relay;
pub mod room;

pub use conn::{Conn, RoomStream};
pub use registry::RoomRegistry;
pub use relay::{
    forward_input, input_topic, mirror_output, output_topic, publish_output, LocalRelay,
    RelayError, RoomRelay,
};
pub use room::{Room, RoomOptions, DEFAULT_IDLE_CHECK, DEFAULT_REPLAY_SIZE};
