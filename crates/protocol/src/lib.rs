//! # KubeJump Protocol Library
//!
//! Wire-level types shared by the gateway engine and anything that talks to
//! it: room events exchanged between a bridged session and its observers,
//! and the session records and administrative tasks handed to the
//! task-tracking collaborator.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{EventKind, RoomMessage};
//!
//! let msg = RoomMessage::data("hello\r\n");
//! let wire = msg.to_json().unwrap();
//! let back = RoomMessage::from_json(&wire).unwrap();
//! assert_eq!(back.event, EventKind::Data);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Room events and terminal geometry
//! - [`records`]: Session records and administrative tasks
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod records;

pub use error::{ProtocolError, Result};
pub use messages::{
    EventKind, MetaMessage, Pty, RoomMessage, WindowSize, ZMODEM_END_EVENT, ZMODEM_START_EVENT,
};
pub use records::{
    SessionRecord, TaskKwargs, TaskName, TerminalTask, PROTOCOL_K8S, SESSION_TYPE_NORMAL,
};
