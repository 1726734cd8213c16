use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{SessionHandle, SharedState};
use crate::config::PipelineDefaults;
use crate::error::{McpError, McpResult};
use crate::pipeline::{
    AggregatedResult, GeneratedQuery, PipelineSnapshot, PipelineStage, RoundHistoryEntry,
    RoundOutcome, SessionConfig,
};

const DEFAULT_TOP_QUERIES: u32 = 10;

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        // Lifecycle
        "pipeline_start" => handle_start(state, arguments).await,
        "pipeline_generate_more" => handle_generate_more(state, arguments).await,
        "pipeline_pause" => handle_pause(state, arguments).await,
        "pipeline_resume" => handle_resume(state, arguments).await,
        "pipeline_stop" => handle_stop(state, arguments).await,
        "pipeline_cancel_query" => handle_cancel_query(state, arguments).await,
        // Inspection
        "pipeline_status" => handle_status(state, arguments).await,
        "pipeline_queries" => handle_queries(state, arguments).await,
        "pipeline_results" => handle_results(state, arguments).await,
        "pipeline_history" => handle_history(state, arguments).await,
        "pipeline_top_queries" => handle_top_queries(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

// ============================================================================
// Parameter and response types
// ============================================================================

/// Arguments of `pipeline_start`. Unset sizes and thresholds use the env defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct StartParams {
    pub persona: String,
    pub seed_query: String,
    pub scoring_instructions: Option<String>,
    pub pass1_threshold: Option<f64>,
    pub pass2_threshold: Option<f64>,
    pub query_budget_per_round: Option<usize>,
    pub concurrency_limit: Option<usize>,
    pub max_results_per_query: Option<usize>,
}

impl StartParams {
    /// Overlay the explicit arguments on `defaults`.
    pub fn into_config(self, defaults: &PipelineDefaults) -> SessionConfig {
        let mut config = SessionConfig::from_defaults(self.persona, self.seed_query, defaults);
        if let Some(instructions) = self.scoring_instructions {
            config.scoring_instructions = instructions;
        }
        if let Some(threshold) = self.pass1_threshold {
            config.pass1_threshold = threshold;
        }
        if let Some(threshold) = self.pass2_threshold {
            config.pass2_threshold = threshold;
        }
        if let Some(budget) = self.query_budget_per_round {
            config.query_budget_per_round = budget;
        }
        if let Some(limit) = self.concurrency_limit {
            config.concurrency_limit = limit;
        }
        if let Some(max_results) = self.max_results_per_query {
            config.max_results_per_query = max_results;
        }
        config
    }
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct CancelQueryParams {
    session_id: String,
    query: String,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    session_id: String,
    limit: Option<usize>,
}

/// Response of `pipeline_start` and `pipeline_generate_more`.
#[derive(Debug, Serialize)]
pub struct RoundStartedResponse {
    pub session_id: String,
    /// `started` or `already_running`.
    pub status: &'static str,
    pub round: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<SessionConfig>,
}

/// Response of the pause/resume/stop/cancel controls.
#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub session_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled: Option<usize>,
    pub stage: PipelineStage,
}

/// Response of `pipeline_status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub session_id: String,
    pub stage: PipelineStage,
    pub round: u32,
    pub running: bool,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_unique_results: usize,
    pub snapshot: PipelineSnapshot,
}

#[derive(Debug, Serialize)]
pub struct QueriesResponse {
    pub session_id: String,
    pub count: usize,
    pub queries: Vec<GeneratedQuery>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub session_id: String,
    pub total_unique_results: usize,
    pub results: Vec<AggregatedResult>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub rounds: Vec<RoundHistoryEntry>,
}

// ============================================================================
// Lifecycle handlers
// ============================================================================

/// Handle pipeline_start - create a session and run round 1 in the background
async fn handle_start(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: StartParams = parse_arguments("pipeline_start", arguments)?;
    let config = params.into_config(&state.config.pipeline);
    config
        .validate()
        .map_err(|e| McpError::InvalidParameters {
            tool_name: "pipeline_start".to_string(),
            message: e.to_string(),
        })?;

    let handle = state.create_session(config.clone());
    let session_id = handle.orchestrator.session_id().to_string();
    spawn_round(handle, RoundKind::Start);

    to_value(RoundStartedResponse {
        session_id,
        status: "started",
        round: 1,
        config: Some(config),
    })
}

/// Handle pipeline_generate_more - run the next round of an existing session
async fn handle_generate_more(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("pipeline_generate_more", arguments)?;
    let handle = state.session(&params.session_id)?;

    let round = handle.orchestrator.round();
    if handle.orchestrator.is_running() {
        return to_value(RoundStartedResponse {
            session_id: params.session_id,
            status: "already_running",
            round,
            config: None,
        });
    }

    spawn_round(handle, RoundKind::More);
    to_value(RoundStartedResponse {
        session_id: params.session_id,
        status: "started",
        round: round + 1,
        config: None,
    })
}

async fn handle_pause(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    control("pipeline_pause", state, arguments, |handle| {
        (handle.orchestrator.pause(), None)
    })
}

async fn handle_resume(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    control("pipeline_resume", state, arguments, |handle| {
        (handle.orchestrator.resume(), None)
    })
}

async fn handle_stop(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    control("pipeline_stop", state, arguments, |handle| {
        let cancelled = handle.orchestrator.stop();
        (true, Some(cancelled))
    })
}

/// Handle pipeline_cancel_query - abort in-flight work for one query
async fn handle_cancel_query(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: CancelQueryParams = parse_arguments("pipeline_cancel_query", arguments)?;
    let handle = state.session(&params.session_id)?;
    let cancelled = handle.orchestrator.cancel_query(&params.query);

    to_value(ControlResponse {
        session_id: params.session_id,
        accepted: cancelled > 0,
        cancelled: Some(cancelled),
        stage: handle.orchestrator.stage(),
    })
}

// ============================================================================
// Inspection handlers
// ============================================================================

async fn handle_status(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("pipeline_status", arguments)?;
    let orchestrator = state.session(&params.session_id)?.orchestrator;

    to_value(StatusResponse {
        session_id: params.session_id,
        stage: orchestrator.stage(),
        round: orchestrator.round(),
        running: orchestrator.is_running(),
        paused: orchestrator.is_paused(),
        error: orchestrator.error(),
        total_unique_results: orchestrator.total_unique_results(),
        snapshot: orchestrator.snapshot(),
    })
}

async fn handle_queries(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("pipeline_queries", arguments)?;
    let queries = match state.session(&params.session_id) {
        Ok(handle) => handle.orchestrator.queries(),
        Err(e) => match &state.storage {
            Some(storage) => storage
                .get_session_queries(&params.session_id)
                .await
                .map_err(execution_failed)?,
            None => return Err(e.into()),
        },
    };

    to_value(QueriesResponse {
        session_id: params.session_id,
        count: queries.len(),
        queries,
    })
}

async fn handle_results(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: ListParams = parse_arguments("pipeline_results", arguments)?;
    let orchestrator = state.session(&params.session_id)?.orchestrator;

    let mut results = orchestrator.results();
    let total_unique_results = results.len();
    if let Some(limit) = params.limit {
        results.truncate(limit);
    }

    to_value(ResultsResponse {
        session_id: params.session_id,
        total_unique_results,
        results,
    })
}

/// Handle pipeline_history - round summaries, from the store for finished processes
async fn handle_history(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("pipeline_history", arguments)?;
    let rounds = match state.session(&params.session_id) {
        Ok(handle) => handle.orchestrator.history(),
        Err(e) => match &state.storage {
            Some(storage) => storage
                .get_round_history(&params.session_id)
                .await
                .map_err(execution_failed)?,
            None => return Err(e.into()),
        },
    };

    to_value(HistoryResponse {
        session_id: params.session_id,
        rounds,
    })
}

/// Handle pipeline_top_queries - best composite scores, read from the store
async fn handle_top_queries(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: ListParams = parse_arguments("pipeline_top_queries", arguments)?;
    let limit = params.limit.map_or(DEFAULT_TOP_QUERIES, |l| l as u32);

    let queries = match &state.storage {
        Some(storage) => storage
            .get_top_queries(&params.session_id, limit)
            .await
            .map_err(execution_failed)?,
        None => {
            let mut queries: Vec<GeneratedQuery> = state
                .session(&params.session_id)?
                .orchestrator
                .queries()
                .into_iter()
                .filter(|q| q.composite_score.is_some())
                .collect();
            queries.sort_by(|a, b| {
                b.composite_score
                    .unwrap_or_default()
                    .total_cmp(&a.composite_score.unwrap_or_default())
            });
            queries.truncate(limit as usize);
            queries
        }
    };

    to_value(QueriesResponse {
        session_id: params.session_id,
        count: queries.len(),
        queries,
    })
}

// ============================================================================
// Helper functions
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum RoundKind {
    Start,
    More,
}

/// Drive one round on the runtime; the caller polls `pipeline_status`.
fn spawn_round(handle: SessionHandle, kind: RoundKind) {
    tokio::spawn(async move {
        let orchestrator = &handle.orchestrator;
        let outcome = match kind {
            RoundKind::Start => orchestrator.start(&handle.config).await,
            RoundKind::More => orchestrator.generate_more(&handle.config).await,
        };
        match outcome {
            Ok(RoundOutcome::Completed {
                round,
                total_unique_results,
            }) => {
                debug!(session_id = %orchestrator.session_id(), round, total_unique_results, "Background round finished");
            }
            Ok(outcome) => {
                debug!(session_id = %orchestrator.session_id(), outcome = ?outcome, "Background round ended early");
            }
            Err(e) => {
                warn!(session_id = %orchestrator.session_id(), error = %e, "Background round failed");
            }
        }
    });
}

fn control(
    tool_name: &str,
    state: &SharedState,
    arguments: Option<Value>,
    action: impl FnOnce(&SessionHandle) -> (bool, Option<usize>),
) -> McpResult<Value> {
    let params: SessionParams = parse_arguments(tool_name, arguments)?;
    let handle = state.session(&params.session_id)?;
    let (accepted, cancelled) = action(&handle);

    to_value(ControlResponse {
        session_id: params.session_id,
        accepted,
        cancelled,
        stage: handle.orchestrator.stage(),
    })
}

/// Helper to parse arguments with consistent error handling
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

fn to_value<T: Serialize>(value: T) -> McpResult<Value> {
    serde_json::to_value(value).map_err(McpError::Json)
}

fn execution_failed(e: impl std::fmt::Display) -> McpError {
    McpError::ExecutionFailed {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Config, DatabaseConfig, LangbaseConfig, LogFormat, LoggingConfig, PipeConfig,
        RequestConfig, SearchConfig,
    };
    use crate::error::{LangbaseResult, SearchApiResult};
    use crate::langbase::{GenerateQueriesRequest, Pass1Request, Pass2Request, TextGenerator};
    use crate::search::{SearchBackend, SearchRequest, SearchResponse, SearchResult};
    use crate::server::AppState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    struct CannedGenerator;

    #[async_trait]
    impl TextGenerator for CannedGenerator {
        async fn generate_queries(&self, _: &GenerateQueriesRequest) -> LangbaseResult<String> {
            Ok(r#"[{"query": "cto fintech", "reasoning": "title"}, {"query": "head of payments", "reasoning": "adjacent"}]"#.to_string())
        }

        async fn score_pass1(&self, _: &Pass1Request) -> LangbaseResult<String> {
            Ok(r#"{"score": 90, "breakdown": {"expectedYield": 35, "personaRelevance": 30, "queryUniqueness": 25}, "reasoning": "good"}"#.to_string())
        }

        async fn score_pass2(&self, _: &Pass2Request) -> LangbaseResult<String> {
            Ok(r#"{"score": 85, "relevantCount": 1, "breakdown": {"resultRelevance": 45, "qualitySignal": 25, "diversity": 15}, "reasoning": "good"}"#.to_string())
        }
    }

    struct CannedSearch;

    #[async_trait]
    impl SearchBackend for CannedSearch {
        async fn search(&self, request: SearchRequest) -> SearchApiResult<SearchResponse> {
            let url = format!("https://example.com/{}", request.query.replace(' ', "-"));
            Ok(SearchResponse {
                results: vec![SearchResult::new(url, request.query.clone(), 1)],
                ..Default::default()
            })
        }
    }

    fn create_test_config() -> Config {
        Config {
            langbase: LangbaseConfig {
                api_key: "test-key".to_string(),
                base_url: "https://api.langbase.com".to_string(),
            },
            search: SearchConfig {
                api_key: "search-key".to_string(),
                base_url: "https://api.search.example.com".to_string(),
                country: "us".to_string(),
                language: "en".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from(":memory:"),
                max_connections: 1,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            request: RequestConfig::default(),
            pipes: PipeConfig::default(),
            pipeline: PipelineDefaults::default(),
        }
    }

    fn create_state() -> SharedState {
        Arc::new(AppState::new(
            create_test_config(),
            Arc::new(CannedGenerator),
            Arc::new(CannedSearch),
        ))
    }

    async fn start_and_wait(state: &SharedState) -> String {
        let response = handle_tool_call(
            state,
            "pipeline_start",
            Some(json!({"persona": "Fintech CTO", "seed_query": "cto fintech"})),
        )
        .await
        .unwrap();
        let session_id = response["session_id"].as_str().unwrap().to_string();

        let mut rx = state.session(&session_id).unwrap().orchestrator.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.progress.stage == PipelineStage::Complete),
        )
        .await
        .unwrap()
        .unwrap();
        session_id
    }

    #[test]
    fn test_start_params_overlay_defaults() {
        let params: StartParams = serde_json::from_value(json!({
            "persona": "p",
            "seed_query": "s",
            "pass1_threshold": 80,
            "concurrency_limit": 7
        }))
        .unwrap();

        let config = params.into_config(&PipelineDefaults::default());
        assert_eq!(config.pass1_threshold, 80.0);
        assert_eq!(config.pass2_threshold, 60.0);
        assert_eq!(config.concurrency_limit, 7);
        assert_eq!(config.query_budget_per_round, 10);
    }

    #[test]
    fn test_parse_arguments_missing() {
        let result: McpResult<SessionParams> = parse_arguments("pipeline_status", None);
        let err = result.unwrap_err();
        assert!(matches!(err, McpError::InvalidParameters { .. }));
        assert!(err.to_string().contains("pipeline_status"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let state = create_state();
        let err = handle_tool_call(&state, "pipeline_teleport", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_start_runs_round_in_background() {
        let state = create_state();
        let session_id = start_and_wait(&state).await;

        let status = handle_tool_call(&state, "pipeline_status", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(status["stage"], "complete");
        assert_eq!(status["round"], 1);
        assert_eq!(status["total_unique_results"], 2);
        assert_eq!(status["snapshot"]["stats"]["completed"], 2);

        let results = handle_tool_call(
            &state,
            "pipeline_results",
            Some(json!({"session_id": session_id, "limit": 1})),
        )
        .await
        .unwrap();
        assert_eq!(results["total_unique_results"], 2);
        assert_eq!(results["results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_generate_more_runs_next_round() {
        let state = create_state();
        let session_id = start_and_wait(&state).await;

        let started = handle_tool_call(
            &state,
            "pipeline_generate_more",
            Some(json!({"session_id": session_id})),
        )
        .await
        .unwrap();
        assert_eq!(started["status"], "started");
        assert_eq!(started["round"], 2);

        let status = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let status =
                    handle_tool_call(&state, "pipeline_status", Some(json!({"session_id": session_id})))
                        .await
                        .unwrap();
                if status["round"] == 2 && status["stage"] == "complete" {
                    break status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("round 2 never completed");
        // The canned batch repeats, so round 2 adds nothing new
        assert_eq!(status["total_unique_results"], 2);
        assert_eq!(status["snapshot"]["stats"]["generated"], 2);

        let results = handle_tool_call(&state, "pipeline_results", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(results["results"].as_array().unwrap().len(), 2);

        let history = handle_tool_call(&state, "pipeline_history", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(history["rounds"].as_array().unwrap().len(), 2);
        assert_eq!(history["rounds"][1]["queries_generated"], 0);
    }

    #[tokio::test]
    async fn test_oldest_finished_sessions_are_evicted() {
        let state: SharedState = Arc::new(
            AppState::new(create_test_config(), Arc::new(CannedGenerator), Arc::new(CannedSearch))
                .with_max_live_sessions(2),
        );

        let first = start_and_wait(&state).await;
        let second = start_and_wait(&state).await;
        let third = start_and_wait(&state).await;

        let mut live = vec![second.clone(), third.clone()];
        live.sort();
        assert_eq!(state.session_ids(), live);

        let err = handle_tool_call(&state, "pipeline_status", Some(json!({"session_id": first})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(
            handle_tool_call(&state, "pipeline_status", Some(json!({"session_id": third})))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let state = create_state();
        let err = handle_tool_call(
            &state,
            "pipeline_start",
            Some(json!({"persona": "p", "seed_query": "s", "pass2_threshold": 150})),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, McpError::InvalidParameters { .. }));
        assert!(err.to_string().contains("pass2_threshold"));
        assert!(state.session_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_is_reported() {
        let state = create_state();
        let err = handle_tool_call(&state, "pipeline_pause", Some(json!({"session_id": "nope"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_controls_on_finished_session() {
        let state = create_state();
        let session_id = start_and_wait(&state).await;

        let paused = handle_tool_call(&state, "pipeline_pause", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(paused["accepted"], false);

        let cancelled = handle_tool_call(
            &state,
            "pipeline_cancel_query",
            Some(json!({"session_id": session_id, "query": "cto fintech"})),
        )
        .await
        .unwrap();
        assert_eq!(cancelled["cancelled"], 0);

        let stopped = handle_tool_call(&state, "pipeline_stop", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(stopped["accepted"], true);
        assert_eq!(stopped["stage"], "complete");
    }

    #[tokio::test]
    async fn test_top_queries_without_store_uses_memory() {
        let state = create_state();
        let session_id = start_and_wait(&state).await;

        let top = handle_tool_call(
            &state,
            "pipeline_top_queries",
            Some(json!({"session_id": session_id, "limit": 1})),
        )
        .await
        .unwrap();
        assert_eq!(top["count"], 1);
        assert_eq!(top["queries"][0]["composite_score"], 86.5);
    }

    #[tokio::test]
    async fn test_history_and_queries() {
        let state = create_state();
        let session_id = start_and_wait(&state).await;

        let history = handle_tool_call(&state, "pipeline_history", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(history["rounds"].as_array().unwrap().len(), 1);
        assert_eq!(history["rounds"][0]["queries_generated"], 2);

        let queries = handle_tool_call(&state, "pipeline_queries", Some(json!({"session_id": session_id})))
            .await
            .unwrap();
        assert_eq!(queries["count"], 2);
    }
}
