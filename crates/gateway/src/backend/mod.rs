//! Backend connections implemented by the gateway itself.

pub mod pty;

pub use pty::{PtyConnection, PtyConnectionFactory};
