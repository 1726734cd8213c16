//! # MCP Query Pipeline Server
//!
//! A Model Context Protocol (MCP) server that builds and refines search
//! queries for a target persona. Candidate queries come from Langbase pipes,
//! pass two scoring gates, and the survivors are executed against a search
//! backend with their results deduplicated across the whole session.
//!
//! ## Features
//!
//! - **Round-based generation**: each round is seeded with the best queries so far
//! - **Two-pass gating**: a cheap text-only score, then a score on a sampled search
//! - **Bounded concurrency**: every stage fans out under a configurable limit
//! - **Pause, stop and per-query cancel**: cooperative, never reported as errors
//! - **Persistence**: sessions, queries and round history in SQLite
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → Langbase Pipes (HTTP)
//!                    ↓          ↘
//!              SQLite (State)    Search backend (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcp_query_pipeline::{Config, AppState, McpServer};
//! use mcp_query_pipeline::langbase::{LangbaseClient, LangbaseGenerator};
//! use mcp_query_pipeline::search::SearchClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let langbase = LangbaseClient::new(&config.langbase, config.request.clone())?;
//!     let generator = Arc::new(LangbaseGenerator::new(langbase, config.pipes.clone()));
//!     let search = Arc::new(SearchClient::new(&config.search, config.request.clone())?);
//!     let state = Arc::new(AppState::new(config, generator, search));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

/// Command-line interface for serving and inspecting stored sessions.
pub mod cli;
/// Configuration management for the MCP server.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Langbase API client and the text-generation seam of the pipeline.
pub mod langbase;
/// The query pipeline: orchestration, scoring, parsing and bookkeeping.
pub mod pipeline;
/// System prompts for Langbase pipes.
pub mod prompts;
/// Search backend client and types.
pub mod search;
/// MCP server implementation and request handling.
pub mod server;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use pipeline::{PipelineOrchestrator, SessionConfig};
pub use server::{AppState, McpServer, SharedState};
