//! Command-line interface.
//!
//! With no subcommand the binary serves MCP over stdio. The remaining
//! subcommands read persisted sessions straight from the SQLite store.

use clap::{Parser, Subcommand};

use crate::storage::{Storage, StoredSession};

/// Top-level arguments.
#[derive(Parser, Debug)]
#[command(name = "mcp-query-pipeline", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve MCP over stdio (default)
    Serve,

    #[command(flatten)]
    Inspect(InspectCommands),
}

/// Read-only views of the session store.
#[derive(Subcommand, Debug, Clone)]
pub enum InspectCommands {
    /// List recent sessions
    Sessions {
        /// Maximum number of sessions to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the round history of a session
    History {
        /// Session ID
        session_id: String,
    },

    /// Show the best queries of a session by composite score
    TopQueries {
        /// Session ID
        session_id: String,

        /// Maximum number of queries to show
        #[arg(long, default_value = "10")]
        limit: u32,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    pub message: String,
}

impl CliResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

const RULE: &str = "──────────────────────────────────────────────────────────────────────\n";

/// Execute an inspection command against `storage`.
pub async fn execute_command(command: InspectCommands, storage: &dyn Storage) -> CliResult {
    match command {
        InspectCommands::Sessions { limit } => execute_sessions(storage, limit).await,
        InspectCommands::History { session_id } => execute_history(storage, &session_id).await,
        InspectCommands::TopQueries { session_id, limit } => {
            execute_top_queries(storage, &session_id, limit).await
        }
    }
}

async fn execute_sessions(storage: &dyn Storage, limit: u32) -> CliResult {
    let sessions = match storage.list_sessions(limit).await {
        Ok(sessions) => sessions,
        Err(e) => return CliResult::error(format!("Failed to list sessions: {}", e)),
    };

    let mut output = String::from("\nPipeline Sessions\n");
    output.push_str(RULE);
    if sessions.is_empty() {
        output.push_str("No sessions recorded.\n");
    }
    for session in &sessions {
        output.push_str(&format_session(session));
    }
    CliResult::success(output)
}

async fn execute_history(storage: &dyn Storage, session_id: &str) -> CliResult {
    match storage.get_session(session_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return CliResult::error(format!("Session not found: {}", session_id)),
        Err(e) => return CliResult::error(format!("Failed to load session: {}", e)),
    }
    let rounds = match storage.get_round_history(session_id).await {
        Ok(rounds) => rounds,
        Err(e) => return CliResult::error(format!("Failed to load history: {}", e)),
    };

    let mut output = format!("\nRound History for {}\n", session_id);
    output.push_str(RULE);
    output.push_str("Round  Generated  Pass1  Pass2  Avg composite\n");
    for entry in &rounds {
        output.push_str(&format!(
            "{:>5}  {:>9}  {:>5}  {:>5}  {}\n",
            entry.round,
            entry.queries_generated,
            entry.queries_passed_pass1,
            entry.queries_passed_pass2,
            entry
                .avg_composite_score
                .map_or_else(|| "-".to_string(), |s| format!("{:.2}", s)),
        ));
    }
    CliResult::success(output)
}

async fn execute_top_queries(storage: &dyn Storage, session_id: &str, limit: u32) -> CliResult {
    let queries = match storage.get_top_queries(session_id, limit).await {
        Ok(queries) => queries,
        Err(e) => return CliResult::error(format!("Failed to load queries: {}", e)),
    };

    let mut output = format!("\nTop Queries for {}\n", session_id);
    output.push_str(RULE);
    for (position, query) in queries.iter().enumerate() {
        output.push_str(&format!(
            "{:>2}. {:>6.2}  {}  ({} results)\n",
            position + 1,
            query.composite_score.unwrap_or_default(),
            query.query,
            query.results_count,
        ));
    }
    CliResult::success(output)
}

fn format_session(session: &StoredSession) -> String {
    let mut line = format!(
        "{}  [{}]  round {}  {}  \"{}\"\n",
        session.id,
        session.status,
        session.round,
        session.updated_at.format("%Y-%m-%d %H:%M"),
        truncate(&session.config.persona, 40),
    );
    if let Some(error) = &session.error {
        line.push_str(&format!("    error: {}\n", error));
    }
    line
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}
