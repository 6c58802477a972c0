//! What a proxy needs to know about one incoming connection.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::session::{ContainerInfo, ExpireInfo};

/// Authenticated user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// Numeric identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Login name.
    pub username: String,
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.username)
    }
}

/// Pod the user asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetInfo {
    /// Numeric identifier.
    pub id: u64,
    /// Cluster the pod runs in.
    pub cluster_name: String,
    /// Namespace of the pod.
    pub namespace: String,
    /// Pod name.
    pub pod_name: String,
    /// Pod address.
    pub pod_ip: String,
}

impl fmt::Display for AssetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster_name, self.namespace, self.pod_name)
    }
}

/// Authorisation result for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Authorisation identifier.
    pub id: String,
    /// Who is connecting.
    pub user: UserInfo,
    /// Where to.
    pub asset: AssetInfo,
    /// When the permission runs out, `None` for never.
    pub expire_at: Option<DateTime<Utc>>,
}

impl ConnectInfo {
    /// Permission expiry as used by the session.
    pub fn expire_info(&self) -> ExpireInfo {
        ExpireInfo {
            expired_at: self.expire_at,
        }
    }
}

/// Options of one proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    auth_info: ConnectInfo,
    container: Option<ContainerInfo>,
}

impl ConnectionOptions {
    /// Creates options for an authorised connection.
    pub fn new(auth_info: ConnectInfo) -> Self {
        Self {
            auth_info,
            container: None,
        }
    }

    /// Targets a specific container.
    pub fn with_container(mut self, container: ContainerInfo) -> Self {
        self.container = Some(container);
        self
    }

    /// Authorisation of the connection.
    pub fn auth_info(&self) -> &ConnectInfo {
        &self.auth_info
    }

    /// Container to open a shell in. Defaults to the asset's pod and its
    /// default container.
    pub fn container(&self) -> ContainerInfo {
        self.container.clone().unwrap_or_else(|| {
            let asset = &self.auth_info.asset;
            ContainerInfo {
                cluster: asset.cluster_name.clone(),
                namespace: asset.namespace.clone(),
                pod: asset.pod_name.clone(),
                container: String::new(),
            }
        })
    }
}
