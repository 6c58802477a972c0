//! Session records and administrative tasks.
//!
//! These are exchanged with the task-tracking and persistence collaborators.
//! The gateway only builds and reads them; it never stores them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol label of container shell sessions.
pub const PROTOCOL_K8S: &str = "k8s";

/// Session type label of ordinary interactive sessions.
pub const SESSION_TYPE_NORMAL: &str = "Normal";

/// Audit record describing one proxied session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session identifier.
    pub id: String,
    /// Display string of the user, `Name(username)`.
    pub user: String,
    /// Description of the target asset.
    pub asset: String,
    /// Label of the channel the user logged in from.
    pub login_from: String,
    /// Remote address of the front-end connection.
    pub remote_addr: String,
    /// Protocol label, see [`PROTOCOL_K8S`].
    pub protocol: String,
    /// Identifier of the user.
    pub user_id: String,
    /// Identifier of the asset.
    pub asset_id: String,
    /// Session type label, see [`SESSION_TYPE_NORMAL`].
    #[serde(rename = "type")]
    pub session_type: String,
    /// When the session started.
    pub date_start: DateTime<Utc>,
}

/// Name of an administrative task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    /// Terminate the session.
    KillSession,
    /// Pause the session.
    LockSession,
    /// Resume a paused session.
    UnlockSession,
    /// Any task name this gateway does not know.
    #[serde(other)]
    Unknown,
}

/// Arguments of an administrative task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskKwargs {
    /// Administrator terminating the session.
    pub terminated_by: String,
    /// Administrator that created a lock or unlock task.
    pub created_by_user: String,
}

/// Administrative command addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalTask {
    /// Task identifier.
    #[serde(default)]
    pub id: String,
    /// What to do.
    pub name: TaskName,
    /// Task arguments.
    #[serde(default)]
    pub kwargs: TaskKwargs,
}

impl TerminalTask {
    /// Creates a task terminating a session.
    pub fn kill(terminated_by: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: TaskName::KillSession,
            kwargs: TaskKwargs {
                terminated_by: terminated_by.into(),
                ..Default::default()
            },
        }
    }

    /// Creates a task pausing a session.
    pub fn lock(created_by: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: TaskName::LockSession,
            kwargs: TaskKwargs {
                created_by_user: created_by.into(),
                ..Default::default()
            },
        }
    }

    /// Creates a task resuming a session.
    pub fn unlock(created_by: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: TaskName::UnlockSession,
            kwargs: TaskKwargs {
                created_by_user: created_by.into(),
                ..Default::default()
            },
        }
    }
}
