//! Per-connection proxy assembly.

use std::sync::Arc;

use chrono::Utc;
use protocol::{SessionRecord, WindowSize, PROTOCOL_K8S, SESSION_TYPE_NORMAL};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::options::ConnectionOptions;
use crate::config::Config;
use crate::exchange::RoomRegistry;
use crate::session::{
    ConnectError, ServerConnection, ServerConnectionFactory, SessionError, SessionExit,
    SessionUser, SwitchOptions, SwitchSession, TaskTracker, TrackedSession, UserConnection,
};
use crate::term;

/// Errors from proxying a connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend shell could not be opened.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// Container the shell was requested in.
        target: String,
        /// Why the factory failed.
        #[source]
        source: ConnectError,
    },

    /// The session could not be bridged.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Collaborators shared by every proxied connection.
#[derive(Clone)]
pub struct ProxyContext {
    /// Opens backend shells.
    pub factory: Arc<dyn ServerConnectionFactory>,
    /// Told about session starts and ends.
    pub tracker: Arc<dyn TaskTracker>,
    /// Where session rooms are published.
    pub rooms: Arc<RoomRegistry>,
    /// Limits applied to every session.
    pub switch: SwitchOptions,
    /// Window used when the front-end reports none.
    pub default_window: WindowSize,
}

impl ProxyContext {
    /// Creates a context with default limits.
    pub fn new(
        factory: Arc<dyn ServerConnectionFactory>,
        tracker: Arc<dyn TaskTracker>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            factory,
            tracker,
            rooms,
            switch: SwitchOptions::default(),
            default_window: WindowSize::new(80, 40),
        }
    }

    /// Creates a context with limits taken from the configuration.
    pub fn from_config(
        config: &Config,
        factory: Arc<dyn ServerConnectionFactory>,
        tracker: Arc<dyn TaskTracker>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            switch: config.switch_options(),
            default_window: config.terminal.default_window(),
            ..Self::new(factory, tracker, rooms)
        }
    }
}

/// Proxies one front-end connection into a container shell.
pub struct ProxyServer {
    id: String,
    user_conn: Arc<dyn UserConnection>,
    options: ConnectionOptions,
    ctx: ProxyContext,
    cached: Mutex<Option<Arc<dyn ServerConnection>>>,
}

impl ProxyServer {
    /// Creates a proxy with a fresh session identifier.
    pub fn new(
        user_conn: Arc<dyn UserConnection>,
        options: ConnectionOptions,
        ctx: ProxyContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_conn,
            options,
            ctx,
            cached: Mutex::new(None),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Builds the audit record of this session.
    pub fn session_record(&self) -> SessionRecord {
        let auth = self.options.auth_info();
        SessionRecord {
            id: self.id.clone(),
            user: auth.user.to_string(),
            asset: auth.asset.to_string(),
            login_from: self.user_conn.login_from().to_string(),
            remote_addr: self.user_conn.remote_addr().to_string(),
            protocol: PROTOCOL_K8S.to_string(),
            user_id: auth.user.id.to_string(),
            asset_id: auth.asset.id.to_string(),
            session_type: SESSION_TYPE_NORMAL.to_string(),
            date_start: Utc::now(),
        }
    }

    /// Runs the session to completion.
    ///
    /// Fails only if the backend cannot be reached, in which case the user
    /// is told why and no room is ever created.
    pub async fn proxy(&self) -> Result<SessionExit, ProxyError> {
        let auth = self.options.auth_info();
        let user = SessionUser {
            id: auth.user.username.clone(),
            display: auth.user.to_string(),
        };
        let mut switch = self.ctx.switch.clone();
        switch.expire = auth.expire_info();

        let session = Arc::new(SwitchSession::new(
            self.id.clone(),
            user,
            switch,
            self.ctx.rooms.clone(),
        ));
        self.ctx
            .tracker
            .add_session(TrackedSession::new(self.session_record(), session.clone()));

        let target = self.options.container();
        let srv_conn = match self.server_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(
                    session_id = %self.id,
                    target = %target,
                    error = %e,
                    "Failed to connect to container"
                );
                let warning = term::warning_line(&format!("Connect to {} failed: {}", target, e));
                if let Err(e) = self.user_conn.write(warning.as_bytes()).await {
                    tracing::debug!(session_id = %self.id, error = %e, "Failed to warn user");
                }
                self.ctx.tracker.remove_session(&self.id);
                return Err(ProxyError::Connect {
                    target: target.to_string(),
                    source: e,
                });
            }
        };

        tracing::info!(
            session_id = %self.id,
            conn_id = %self.user_conn.id(),
            target = %target,
            "Session created"
        );
        if let Err(e) = self.user_conn.write(term::CRLF.as_bytes()).await {
            tracing::debug!(session_id = %self.id, error = %e, "Failed to write to user");
        }

        let result = session.bridge(self.user_conn.clone(), srv_conn).await;

        self.ctx.tracker.remove_session(&self.id);
        self.cached.lock().await.take();

        match &result {
            Ok(exit) => tracing::info!(session_id = %self.id, reason = ?exit, "Session ended"),
            Err(e) => tracing::error!(session_id = %self.id, error = %e, "Session bridge failed"),
        }
        Ok(result?)
    }

    async fn server_conn(&self) -> Result<Arc<dyn ServerConnection>, ConnectError> {
        let mut cached = self.cached.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let mut window = self.user_conn.pty().window;
        if window.is_empty() {
            window = self.ctx.default_window;
        }

        let conn = self
            .ctx
            .factory
            .connect(&self.options.container(), window)
            .await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }
}
