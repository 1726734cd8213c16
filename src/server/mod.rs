//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state holding the live pipeline sessions

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::langbase::TextGenerator;
use crate::pipeline::{PipelineOrchestrator, PipelineSettings, SessionConfig};
use crate::search::SearchBackend;
use crate::storage::Storage;

/// Sessions kept in memory before idle ones are evicted.
pub const DEFAULT_MAX_LIVE_SESSIONS: usize = 32;

/// A live session: its orchestrator and the config it was started with.
#[derive(Clone)]
pub struct SessionHandle {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub config: SessionConfig,
    /// Creation order within this process.
    pub sequence: u64,
}

/// Application state shared across handlers.
///
/// Collaborators are trait objects so tests can run the full tool surface
/// against in-memory fakes.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Persistence store; sessions run without one when absent.
    pub storage: Option<Arc<dyn Storage>>,
    /// Text-generation backend shared by all sessions.
    pub generator: Arc<dyn TextGenerator>,
    /// Search backend shared by all sessions.
    pub search: Arc<dyn SearchBackend>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_live_sessions: usize,
    next_sequence: AtomicU64,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        generator: Arc<dyn TextGenerator>,
        search: Arc<dyn SearchBackend>,
    ) -> Self {
        info!(
            generation_pipe = %config.pipes.query_generation,
            pass1_pipe = %config.pipes.pass1,
            pass2_pipe = %config.pipes.pass2,
            "AppState initializing with pipe configuration"
        );

        Self {
            config,
            storage: None,
            generator,
            search,
            sessions: RwLock::new(HashMap::new()),
            max_live_sessions: DEFAULT_MAX_LIVE_SESSIONS,
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Cap the in-memory registry. Zero is treated as one.
    pub fn with_max_live_sessions(mut self, max: usize) -> Self {
        self.max_live_sessions = max.max(1);
        self
    }

    /// Register a fresh session for `config` and return its handle.
    pub fn create_session(&self, config: SessionConfig) -> SessionHandle {
        let id = Uuid::new_v4().to_string();
        let mut orchestrator = PipelineOrchestrator::new(
            id.clone(),
            self.generator.clone(),
            self.search.clone(),
            PipelineSettings::from_config(&self.config),
        );
        if let Some(storage) = &self.storage {
            orchestrator = orchestrator.with_storage(storage.clone());
        }

        let handle = SessionHandle {
            orchestrator: Arc::new(orchestrator),
            config,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };
        {
            let mut sessions = self.sessions.write();
            evict_idle(&mut sessions, self.max_live_sessions.saturating_sub(1));
            sessions.insert(id.clone(), handle.clone());
        }
        info!(session_id = %id, "Pipeline session created");
        handle
    }

    /// Look up a live session.
    pub fn session(&self, session_id: &str) -> PipelineResult<SessionHandle> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| PipelineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Ids of all live sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Drop the oldest idle sessions until at most `keep` remain.
///
/// Running sessions are never evicted, so the registry can exceed `keep`
/// while they last. Evicted sessions stay readable through the store.
fn evict_idle(sessions: &mut HashMap<String, SessionHandle>, keep: usize) {
    if sessions.len() <= keep {
        return;
    }
    let mut idle: Vec<(u64, String)> = sessions
        .iter()
        .filter(|(_, handle)| !handle.orchestrator.is_running())
        .map(|(id, handle)| (handle.sequence, id.clone()))
        .collect();
    idle.sort();

    let excess = sessions.len() - keep;
    for (_, id) in idle.into_iter().take(excess) {
        sessions.remove(&id);
        debug!(session_id = %id, "Idle session evicted from memory");
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
