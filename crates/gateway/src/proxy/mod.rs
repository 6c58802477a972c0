//! Proxying of authorised connections into container shells.

pub mod options;
pub mod server;

pub use options::{AssetInfo, ConnectInfo, ConnectionOptions, UserInfo};
pub use server::{ProxyContext, ProxyError, ProxyServer};
