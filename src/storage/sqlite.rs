use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{SessionStatus, Storage, StoredSession};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::pipeline::{ExecStatus, GeneratedQuery, RoundHistoryEntry, ScoreStatus};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `config.path` and migrate it.
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_session(&self, session: &StoredSession) -> StorageResult<()> {
        let config = serde_json::to_string(&session.config).map_err(|e| StorageError::Query {
            message: format!("Failed to serialize session config: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_sessions (id, config, status, round, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                config = excluded.config,
                status = excluded.status,
                round = excluded.round,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(&config)
        .bind(session.status.as_str())
        .bind(session.round as i64)
        .bind(&session.error)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(session_id = %session.id, "Session saved");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<StoredSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, config, status, round, error, created_at, updated_at
            FROM pipeline_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredSession::try_from).transpose()
    }

    async fn list_sessions(&self, limit: u32) -> StorageResult<Vec<StoredSession>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, config, status, round, error, created_at, updated_at
            FROM pipeline_sessions
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredSession::try_from).collect()
    }

    async fn update_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        round: u32,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_sessions
            SET status = ?, round = ?, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(round as i64)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SessionNotFound {
                session_id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_queries(
        &self,
        session_id: &str,
        queries: &[GeneratedQuery],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for query in queries {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO pipeline_queries (
                    session_id, query_key, query, round, reasoning,
                    pass1_score, pass1_status, pass1_reasoning,
                    pass2_score, pass2_status, pass2_reasoning,
                    composite_score, exec_status, results_count, error, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session_id)
            .bind(query.key())
            .bind(&query.query)
            .bind(query.round as i64)
            .bind(&query.reasoning)
            .bind(query.pass1_score)
            .bind(query.pass1_status.as_str())
            .bind(&query.pass1_reasoning)
            .bind(query.pass2_score)
            .bind(query.pass2_status.map(|s| s.as_str()))
            .bind(&query.pass2_reasoning)
            .bind(query.composite_score)
            .bind(query.exec_status.map(|s| s.as_str()))
            .bind(query.results_count as i64)
            .bind(&query.error)
            .bind(query.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(session_id = %session_id, count = queries.len(), "Queries inserted");
        Ok(())
    }

    async fn update_query(&self, session_id: &str, query: &GeneratedQuery) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_queries
            SET pass1_score = ?, pass1_status = ?, pass1_reasoning = ?,
                pass2_score = ?, pass2_status = ?, pass2_reasoning = ?,
                composite_score = ?, exec_status = ?, results_count = ?, error = ?
            WHERE session_id = ? AND query_key = ?
            "#,
        )
        .bind(query.pass1_score)
        .bind(query.pass1_status.as_str())
        .bind(&query.pass1_reasoning)
        .bind(query.pass2_score)
        .bind(query.pass2_status.map(|s| s.as_str()))
        .bind(&query.pass2_reasoning)
        .bind(query.composite_score)
        .bind(query.exec_status.map(|s| s.as_str()))
        .bind(query.results_count as i64)
        .bind(&query.error)
        .bind(session_id)
        .bind(query.key())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session_queries(&self, session_id: &str) -> StorageResult<Vec<GeneratedQuery>> {
        let rows: Vec<QueryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pipeline_queries WHERE session_id = ? ORDER BY round ASC, created_at ASC",
            QUERY_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(GeneratedQuery::from).collect())
    }

    async fn get_top_queries(
        &self,
        session_id: &str,
        limit: u32,
    ) -> StorageResult<Vec<GeneratedQuery>> {
        let rows: Vec<QueryRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM pipeline_queries
            WHERE session_id = ? AND composite_score IS NOT NULL
            ORDER BY composite_score DESC, created_at ASC
            LIMIT ?
            "#,
            QUERY_COLUMNS
        ))
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(GeneratedQuery::from).collect())
    }

    async fn append_round(&self, session_id: &str, entry: &RoundHistoryEntry) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pipeline_rounds (
                session_id, round, queries_generated, queries_passed_pass1,
                queries_passed_pass2, avg_composite_score, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(entry.round as i64)
        .bind(entry.queries_generated as i64)
        .bind(entry.queries_passed_pass1 as i64)
        .bind(entry.queries_passed_pass2 as i64)
        .bind(entry.avg_composite_score)
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_round_history(&self, session_id: &str) -> StorageResult<Vec<RoundHistoryEntry>> {
        let rows: Vec<RoundRow> = sqlx::query_as(
            r#"
            SELECT round, queries_generated, queries_passed_pass1, queries_passed_pass2,
                   avg_composite_score, timestamp
            FROM pipeline_rounds
            WHERE session_id = ?
            ORDER BY round ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RoundHistoryEntry::from).collect())
    }
}

const QUERY_COLUMNS: &str = "query, round, reasoning, pass1_score, pass1_status, pass1_reasoning, \
    pass2_score, pass2_status, pass2_reasoning, composite_score, exec_status, results_count, \
    error, created_at";

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    config: String,
    status: String,
    round: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SessionRow> for StoredSession {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let config = serde_json::from_str(&row.config).map_err(|e| StorageError::Query {
            message: format!("Corrupt config for session {}: {}", row.id, e),
        })?;

        Ok(Self {
            config,
            status: row.status.parse().unwrap_or_default(),
            round: row.round.max(0) as u32,
            error: row.error,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
            id: row.id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueryRow {
    query: String,
    round: i64,
    reasoning: String,
    pass1_score: Option<f64>,
    pass1_status: String,
    pass1_reasoning: Option<String>,
    pass2_score: Option<f64>,
    pass2_status: Option<String>,
    pass2_reasoning: Option<String>,
    composite_score: Option<f64>,
    exec_status: Option<String>,
    results_count: i64,
    error: Option<String>,
    created_at: String,
}

impl From<QueryRow> for GeneratedQuery {
    fn from(row: QueryRow) -> Self {
        Self {
            query: row.query,
            round: row.round.max(0) as u32,
            reasoning: row.reasoning,
            pass1_score: row.pass1_score,
            pass1_status: row.pass1_status.parse().unwrap_or_default(),
            pass1_reasoning: row.pass1_reasoning,
            pass2_score: row.pass2_score,
            pass2_status: row
                .pass2_status
                .and_then(|s| s.parse::<ScoreStatus>().ok()),
            pass2_reasoning: row.pass2_reasoning,
            composite_score: row.composite_score,
            exec_status: row.exec_status.and_then(|s| s.parse::<ExecStatus>().ok()),
            results_count: row.results_count.max(0) as usize,
            error: row.error,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RoundRow {
    round: i64,
    queries_generated: i64,
    queries_passed_pass1: i64,
    queries_passed_pass2: i64,
    avg_composite_score: Option<f64>,
    timestamp: String,
}

impl From<RoundRow> for RoundHistoryEntry {
    fn from(row: RoundRow) -> Self {
        Self {
            round: row.round.max(0) as u32,
            queries_generated: row.queries_generated.max(0) as usize,
            queries_passed_pass1: row.queries_passed_pass1.max(0) as usize,
            queries_passed_pass2: row.queries_passed_pass2.max(0) as usize,
            avg_composite_score: row.avg_composite_score,
            timestamp: parse_timestamp(&row.timestamp),
        }
    }
}
