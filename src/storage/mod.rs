//! Storage layer for pipeline session persistence.
//!
//! SQLite-backed storage for sessions, generated queries and round history.
//! The orchestrator treats every call as best-effort; the store is never the
//! source of truth for a running session.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::pipeline::{GeneratedQuery, RoundHistoryEntry, SessionConfig};

/// Lifecycle status of a persisted session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(SessionStatus::Running),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "stopped" => Ok(SessionStatus::Stopped),
            "error" => Ok(SessionStatus::Error),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// A persisted pipeline session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    /// Last round that finished.
    pub round: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredSession {
    /// New running session with a fresh id.
    pub fn new(config: SessionConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            status: SessionStatus::Running,
            round: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Persistence store for pipeline sessions.
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Insert or replace a session.
    async fn save_session(&self, session: &StoredSession) -> StorageResult<()>;
    async fn get_session(&self, id: &str) -> StorageResult<Option<StoredSession>>;
    /// Most recently updated sessions first.
    async fn list_sessions(&self, limit: u32) -> StorageResult<Vec<StoredSession>>;
    /// Patch status, round and error. Fails with `SessionNotFound` for unknown ids.
    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        round: u32,
        error: Option<&str>,
    ) -> StorageResult<()>;

    // Query operations

    /// Batch-insert one round's generated queries. Existing rows are left alone.
    async fn insert_queries(&self, session_id: &str, queries: &[GeneratedQuery])
        -> StorageResult<()>;
    /// Patch the score and execution fields of one query.
    async fn update_query(&self, session_id: &str, query: &GeneratedQuery) -> StorageResult<()>;
    async fn get_session_queries(&self, session_id: &str) -> StorageResult<Vec<GeneratedQuery>>;
    /// Highest composite scores first; queries without one are excluded.
    async fn get_top_queries(&self, session_id: &str, limit: u32)
        -> StorageResult<Vec<GeneratedQuery>>;

    // Round history

    async fn append_round(&self, session_id: &str, entry: &RoundHistoryEntry)
        -> StorageResult<()>;
    async fn get_round_history(&self, session_id: &str) -> StorageResult<Vec<RoundHistoryEntry>>;
}
