//! Room event definitions.
//!
//! A room carries every event of one bridged session: terminal output,
//! collaborator joins and leaves, window changes and administrative notices.
//! The same JSON shape is used when events are relayed to another gateway
//! instance, so field names and event strings are part of the wire contract.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Action body announcing that a bulk binary transfer started.
pub const ZMODEM_START_EVENT: &str = "ZMODEM_START";

/// Action body announcing that a bulk binary transfer ended.
pub const ZMODEM_END_EVENT: &str = "ZMODEM_END";

/// Kind of a room event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Terminal bytes.
    Data,
    /// Liveness probe, delivered as an empty write.
    Ping,
    /// Terminal window size changed.
    Windows,
    /// Session paused by an administrator.
    Pause,
    /// Session resumed by an administrator.
    Resume,
    /// Observer joined the room.
    Join,
    /// Observer left the room.
    Leave,
    /// Session exited.
    Exit,
    /// Observer join acknowledged.
    JoinSuccess,
    /// Collaborator joined a shared session.
    #[serde(rename = "Share_JOIN")]
    ShareJoin,
    /// Collaborator left a shared session.
    #[serde(rename = "Share_LEAVE")]
    ShareLeave,
    /// Snapshot of current collaborators.
    #[serde(rename = "Share_USERS")]
    ShareUsers,
    /// Mode marker, see [`ZMODEM_START_EVENT`].
    Action,
    /// Collaborator removed by the session owner.
    #[serde(rename = "Share_REMOVE_USER")]
    ShareRemoveUser,
}

impl EventKind {
    /// Returns the wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Data => "Data",
            EventKind::Ping => "Ping",
            EventKind::Windows => "Windows",
            EventKind::Pause => "Pause",
            EventKind::Resume => "Resume",
            EventKind::Join => "Join",
            EventKind::Leave => "Leave",
            EventKind::Exit => "Exit",
            EventKind::JoinSuccess => "JoinSuccess",
            EventKind::ShareJoin => "Share_JOIN",
            EventKind::ShareLeave => "Share_LEAVE",
            EventKind::ShareUsers => "Share_USERS",
            EventKind::Action => "Action",
            EventKind::ShareRemoveUser => "Share_REMOVE_USER",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of the observer an event refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaMessage {
    /// Login name of the user.
    pub user_id: String,
    /// Display string of the user.
    pub user: String,
    /// UTC timestamp at which the observer connected.
    pub created: String,
    /// Remote address of the observer's connection.
    pub remote_addr: String,
    /// Identifier of the observer's terminal connection.
    pub terminal_id: String,
    /// Whether this observer owns the session.
    pub primary: bool,
    /// Whether this observer may type into the session.
    pub writable: bool,
}

impl MetaMessage {
    /// Key used to track one collaborator connection.
    ///
    /// The same user connected twice has two distinct keys.
    pub fn online_key(&self) -> (String, String) {
        (self.user.clone(), self.created.clone())
    }
}

/// One room event.
///
/// Bodies are reference counted, so cloning a message for fan-out never
/// copies terminal data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    /// Event kind.
    pub event: EventKind,
    /// Event payload, base64 encoded on the wire.
    #[serde(rename = "data", with = "body_encoding", default)]
    pub body: Bytes,
    /// Provenance, required on input events.
    #[serde(default)]
    pub meta: MetaMessage,
}

impl RoomMessage {
    /// Creates a message without provenance.
    pub fn new(event: EventKind, body: impl Into<Bytes>) -> Self {
        Self {
            event,
            body: body.into(),
            meta: MetaMessage::default(),
        }
    }

    /// Creates a `Data` message.
    pub fn data(body: impl Into<Bytes>) -> Self {
        Self::new(EventKind::Data, body)
    }

    /// Creates an `Action` message carrying a mode marker.
    pub fn action(marker: &'static str) -> Self {
        Self::new(EventKind::Action, Bytes::from_static(marker.as_bytes()))
    }

    /// Attaches provenance to the message.
    pub fn with_meta(mut self, meta: MetaMessage) -> Self {
        self.meta = meta;
        self
    }

    /// Returns true when this is an `Action` message starting a bulk transfer.
    pub fn is_bulk_transfer_start(&self) -> bool {
        self.event == EventKind::Action && self.body.as_ref() == ZMODEM_START_EVENT.as_bytes()
    }

    /// Serializes the message to its JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a message from its JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Terminal window dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Columns.
    #[serde(rename = "Width")]
    pub width: u16,
    /// Rows.
    #[serde(rename = "Height")]
    pub height: u16,
}

impl WindowSize {
    /// Creates a window size.
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Pseudo terminal requested by a front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pty {
    /// Terminal type, e.g. `xterm-256color`.
    pub term: String,
    /// Current window.
    pub window: WindowSize,
}

/// Encodes bodies the way byte slices are encoded by the other gateway
/// implementations: a base64 string, `null` for no data.
mod body_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        if body.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(body))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            None => Ok(Bytes::new()),
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
        }
    }
}
