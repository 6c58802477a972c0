//! # KubeJump Gateway Library
//!
//! Session proxy and broadcast engine of the KubeJump bastion. A user who
//! has been authorised for a container is connected to a shell inside it,
//! and everything the shell prints is fanned out to a room that other
//! users can join to watch or collaborate.
//!
//! ## Architecture
//!
//! ```text
//!   user terminal                                         container shell
//! ┌───────────────┐      ┌──────────────────────┐       ┌────────────────┐
//! │UserConnection │─────▶│    frontend pump     │──────▶│                │
//! │               │      └──────────────────────┘       │ServerConnection│
//! │               │      ┌──────────────────────┐       │                │
//! │               │◀─┐   │     backend pump     │◀──────│                │
//! └───────────────┘  │   └──────────┬───────────┘       └────────────────┘
//!                    │              │
//!                    │   ┌──────────▼───────────┐
//!                    │   │    SwitchSession     │  limits, admin tasks
//!                    │   └──────────┬───────────┘
//!                    │              │
//!                    │   ┌──────────▼───────────┐       ┌────────────────┐
//!                    └───│         Room         │──────▶│ observers/relay│
//!                        └──────────────────────┘       └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`exchange`]: Rooms, observers and cross-instance relay
//! - [`session`]: Connection traits, pumps and the session bridge
//! - [`proxy`]: Assembles a session for one authorised connection
//! - [`backend`]: Local PTY shells
//! - [`local`]: The gateway's own terminal as a front-end
//! - [`term`]: Terminal control sequences written to users

pub mod backend;
pub mod config;
pub mod exchange;
pub mod local;
pub mod proxy;
pub mod session;
pub mod term;

#[cfg(test)]
mod testing;

pub use protocol;

pub use config::Config;

pub use exchange::{Conn, Room, RoomOptions, RoomRegistry, RoomStream};

pub use session::{
    ServerConnection, ServerConnectionFactory, SessionError, SessionExit, SessionRegistry,
    SwitchOptions, SwitchSession, TaskTracker, UserConnection,
};

pub use proxy::{ConnectionOptions, ProxyContext, ProxyError, ProxyServer};

pub use backend::{PtyConnection, PtyConnectionFactory};

pub use local::{RawModeGuard, StdioConnection};
