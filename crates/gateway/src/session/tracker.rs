//! Tracking of live sessions and dispatch of administrative tasks.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use protocol::{SessionRecord, TerminalTask};
use thiserror::Error;

/// Errors dispatching an administrative task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No live session has the given identifier.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session does not understand the task.
    #[error("unknown task for session {session_id}")]
    UnknownTask {
        /// Target session.
        session_id: String,
    },

    /// The task payload could not be parsed.
    #[error("malformed task: {0}")]
    Malformed(String),
}

/// Something that can execute administrative tasks.
pub trait TaskHandler: Send + Sync {
    /// Executes one task.
    fn handle_task<'a>(&'a self, task: TerminalTask) -> BoxFuture<'a, Result<(), TaskError>>;
}

/// A live session as seen by the tracker.
#[derive(Clone)]
pub struct TrackedSession {
    /// Audit record of the session.
    pub record: SessionRecord,
    handler: Arc<dyn TaskHandler>,
}

impl TrackedSession {
    /// Pairs a record with the handler executing tasks for it.
    pub fn new(record: SessionRecord, handler: Arc<dyn TaskHandler>) -> Self {
        Self { record, handler }
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Collaborator told about session starts and ends.
pub trait TaskTracker: Send + Sync {
    /// Records a session that just started.
    fn add_session(&self, session: TrackedSession);

    /// Forgets a session that ended. Unknown identifiers are ignored.
    fn remove_session(&self, session_id: &str);
}

/// In-memory tracker routing tasks to live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, TrackedSession>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of a live session.
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.record.clone())
    }

    /// Returns the records of all live sessions.
    pub fn list(&self) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Routes a task to a live session.
    pub async fn dispatch(&self, session_id: &str, task: TerminalTask) -> Result<(), TaskError> {
        // Clone the handler out so the map is not locked while the task runs.
        let handler = self
            .sessions
            .get(session_id)
            .map(|entry| entry.handler.clone())
            .ok_or_else(|| TaskError::SessionNotFound(session_id.to_string()))?;

        let name = task.name;
        let result = handler.handle_task(task).await;
        match &result {
            Ok(()) => tracing::info!(session_id = %session_id, task = ?name, "Task handled"),
            Err(e) => tracing::warn!(session_id = %session_id, task = ?name, error = %e, "Task rejected"),
        }
        result
    }

    /// Parses a task from JSON and routes it to a live session.
    pub async fn dispatch_json(&self, session_id: &str, json: &str) -> Result<(), TaskError> {
        let task: TerminalTask =
            serde_json::from_str(json).map_err(|e| TaskError::Malformed(e.to_string()))?;
        self.dispatch(session_id, task).await
    }
}

impl TaskTracker for SessionRegistry {
    fn add_session(&self, session: TrackedSession) {
        tracing::info!(session_id = %session.id(), user = %session.record.user, "Session tracked");
        self.sessions.insert(session.id().to_string(), session);
    }

    fn remove_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            tracing::info!(session_id = %session_id, "Session untracked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use protocol::TaskName;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        tasks: Mutex<Vec<TerminalTask>>,
    }

    impl TaskHandler for Recorder {
        fn handle_task<'a>(&'a self, task: TerminalTask) -> BoxFuture<'a, Result<(), TaskError>> {
            Box::pin(async move {
                if task.name == TaskName::Unknown {
                    return Err(TaskError::UnknownTask {
                        session_id: "s-1".to_string(),
                    });
                }
                self.tasks.lock().unwrap().push(task);
                Ok(())
            })
        }
    }

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            user: "Alice(alice)".to_string(),
            asset: "prod/web-0".to_string(),
            login_from: "ST".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            protocol: protocol::PROTOCOL_K8S.to_string(),
            user_id: "1".to_string(),
            asset_id: "2".to_string(),
            session_type: protocol::SESSION_TYPE_NORMAL.to_string(),
            date_start: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let registry = SessionRegistry::new();
        registry.add_session(TrackedSession::new(record("s-1"), Arc::new(Recorder::default())));

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("s-1").unwrap().user, "Alice(alice)");
        assert_eq!(registry.list().len(), 1);

        registry.remove_session("s-1");
        registry.remove_session("s-1");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_reaches_handler() {
        let registry = SessionRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add_session(TrackedSession::new(record("s-1"), recorder.clone()));

        registry
            .dispatch("s-1", TerminalTask::lock("admin1"))
            .await
            .unwrap();

        let tasks = recorder.tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kwargs.created_by_user, "admin1");
    }

    #[tokio::test]
    async fn test_dispatch_to_missing_session() {
        let registry = SessionRegistry::new();
        let err = registry
            .dispatch("nope", TerminalTask::kill("root"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::SessionNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_dispatch_json() {
        let registry = SessionRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.add_session(TrackedSession::new(record("s-1"), recorder.clone()));

        registry
            .dispatch_json(
                "s-1",
                r#"{"name":"kill_session","kwargs":{"terminated_by":"root"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(recorder.tasks.lock().unwrap()[0].name, TaskName::KillSession);

        let err = registry.dispatch_json("s-1", "{not json").await.unwrap_err();
        assert!(matches!(err, TaskError::Malformed(_)));

        let err = registry
            .dispatch_json("s-1", r#"{"name":"format_disk"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::UnknownTask { .. }));
    }
}
