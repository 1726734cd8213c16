//! End-to-end pipeline tests
//!
//! Drives full rounds through the orchestrator with in-process text
//! generation and search backends, persisting to a temporary SQLite file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use mcp_query_pipeline::config::{DatabaseConfig, PipelineDefaults};
use mcp_query_pipeline::error::{LangbaseResult, SearchApiResult};
use mcp_query_pipeline::langbase::{
    GenerateQueriesRequest, Pass1Request, Pass2Request, TextGenerator,
};
use mcp_query_pipeline::pipeline::{
    normalize_query, ExecStatus, PipelineOrchestrator, PipelineSettings, PipelineStage,
    RoundOutcome, ScoreStatus, SessionConfig,
};
use mcp_query_pipeline::search::{SearchBackend, SearchRequest, SearchResponse, SearchResult};
use mcp_query_pipeline::storage::{SessionStatus, SqliteStorage, Storage};

/// Generator that serves one batch per round and fixed scores per query.
struct RoundGenerator {
    rounds: HashMap<u32, Vec<&'static str>>,
    pass1: HashMap<String, f64>,
    pass2: HashMap<String, f64>,
}

impl RoundGenerator {
    fn new() -> Self {
        let rounds = HashMap::from([
            (1, vec!["CTO fintech London", "VP Engineering payments", "fintech"]),
            (2, vec!["cto fintech london", "Head of Platform neobank"]),
        ]);
        let pass1 = HashMap::from([
            ("cto fintech london".to_string(), 90.0),
            ("vp engineering payments".to_string(), 80.0),
            ("fintech".to_string(), 30.0),
            ("head of platform neobank".to_string(), 75.0),
        ]);
        let pass2 = HashMap::from([
            ("cto fintech london".to_string(), 70.0),
            ("vp engineering payments".to_string(), 50.0),
            ("head of platform neobank".to_string(), 95.0),
        ]);
        Self {
            rounds,
            pass1,
            pass2,
        }
    }
}

#[async_trait]
impl TextGenerator for RoundGenerator {
    async fn generate_queries(&self, request: &GenerateQueriesRequest) -> LangbaseResult<String> {
        let batch: Vec<_> = self
            .rounds
            .get(&request.round)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|query| json!({"query": query, "reasoning": format!("round {}", request.round)}))
            .collect();
        Ok(json!(batch).to_string())
    }

    async fn score_pass1(&self, request: &Pass1Request) -> LangbaseResult<String> {
        let score = self.pass1[&normalize_query(&request.query)];
        Ok(json!({
            "score": score,
            "breakdown": {"expectedYield": 30, "personaRelevance": 30, "queryUniqueness": 20},
            "reasoning": "fixed"
        })
        .to_string())
    }

    async fn score_pass2(&self, request: &Pass2Request) -> LangbaseResult<String> {
        let score = self.pass2[&normalize_query(&request.query)];
        Ok(json!({
            "score": score,
            "relevantCount": request.sampled_results.len(),
            "breakdown": {"resultRelevance": 40, "qualitySignal": 20, "diversity": 15},
            "reasoning": "fixed",
            "topMatches": []
        })
        .to_string())
    }
}

/// Two hits per query plus one url that every query returns.
#[derive(Default)]
struct SharedUrlSearch {
    slow: Option<String>,
    calls: Mutex<Vec<SearchRequest>>,
}

#[async_trait]
impl SearchBackend for SharedUrlSearch {
    async fn search(&self, request: SearchRequest) -> SearchApiResult<SearchResponse> {
        self.calls.lock().push(request.clone());
        let key = normalize_query(&request.query);
        // Only full executions are slowed; the Pass 2 sample returns at once
        if self.slow.as_deref() == Some(key.as_str()) && request.max_results > 5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        let slug = key.replace(' ', "-");
        Ok(SearchResponse {
            results: vec![
                SearchResult::new(format!("https://example.com/{}/a", slug), "a", 1),
                SearchResult::new(format!("https://example.com/{}/b", slug), "b", 2),
                SearchResult::new("https://example.com/shared", "shared", 3),
            ],
            ..Default::default()
        })
    }
}

async fn create_storage(dir: &TempDir) -> Arc<SqliteStorage> {
    Arc::new(
        SqliteStorage::new(&DatabaseConfig {
            path: dir.path().join("pipeline.db"),
            max_connections: 2,
        })
        .await
        .unwrap(),
    )
}

fn session_config() -> SessionConfig {
    SessionConfig::from_defaults("Fintech CTO", "cto fintech", &PipelineDefaults::default())
        .with_thresholds(70.0, 60.0)
        .with_concurrency(2)
}

#[tokio::test]
async fn test_two_rounds_persist_session_queries_and_history() {
    let dir = TempDir::new().unwrap();
    let storage = create_storage(&dir).await;
    let search = Arc::new(SharedUrlSearch::default());
    let orchestrator = PipelineOrchestrator::new(
        "e2e",
        Arc::new(RoundGenerator::new()),
        search.clone(),
        PipelineSettings::default(),
    )
    .with_storage(storage.clone());
    let config = session_config();

    let first = orchestrator.start(&config).await.unwrap();
    assert_eq!(
        first,
        RoundOutcome::Completed {
            round: 1,
            total_unique_results: 3
        }
    );

    let second = orchestrator.generate_more(&config).await.unwrap();
    assert_eq!(
        second,
        RoundOutcome::Completed {
            round: 2,
            total_unique_results: 5
        }
    );

    // In-memory view
    let cto = orchestrator.query("CTO FINTECH LONDON").unwrap();
    assert_eq!(cto.round, 1);
    assert_eq!(cto.composite_score, Some(76.0));
    let vp = orchestrator.query("vp engineering payments").unwrap();
    assert_eq!(vp.pass2_status, Some(ScoreStatus::Failed));
    assert!(vp.composite_score.is_none());
    let broad = orchestrator.query("fintech").unwrap();
    assert_eq!(broad.pass1_status, ScoreStatus::Failed);
    assert!(broad.pass2_status.is_none());

    let stats = orchestrator.stats();
    assert_eq!(stats.generated, 4);
    assert_eq!(stats.completed, 2);
    assert!(stats.pass1_balanced());
    assert!(stats.pass2_balanced());

    let top = orchestrator.top_queries(5);
    assert_eq!(top[0].query, "Head of Platform neobank");
    assert_eq!(top[0].composite_score, 89.0);

    // Persisted view
    let session = storage.get_session("e2e").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.round, 2);
    assert_eq!(session.config, config);

    let stored = storage.get_session_queries("e2e").await.unwrap();
    assert_eq!(stored.len(), 4);
    let stored_cto = stored
        .iter()
        .find(|q| q.key() == "cto fintech london")
        .unwrap();
    assert_eq!(stored_cto.exec_status, Some(ExecStatus::Completed));
    assert_eq!(stored_cto.results_count, 3);

    let stored_top = storage.get_top_queries("e2e", 10).await.unwrap();
    let names: Vec<&str> = stored_top.iter().map(|q| q.query.as_str()).collect();
    assert_eq!(names, vec!["Head of Platform neobank", "CTO fintech London"]);

    let history = storage.get_round_history("e2e").await.unwrap();
    assert_eq!(history, orchestrator.history());
    assert_eq!(history[0].queries_generated, 3);
    assert_eq!(history[0].queries_passed_pass1, 2);
    assert_eq!(history[0].queries_passed_pass2, 1);
    assert_eq!(history[1].queries_generated, 1);

    // One sample search per Pass 1 survivor, one execution per Pass 2 survivor
    let calls = search.calls.lock();
    assert_eq!(calls.iter().filter(|r| r.max_results == 5).count(), 3);
    assert_eq!(calls.iter().filter(|r| r.max_results == 50).count(), 2);
}

#[tokio::test]
async fn test_cancelled_query_stays_pending_and_round_completes() {
    let dir = TempDir::new().unwrap();
    let storage = create_storage(&dir).await;
    let mut generator = RoundGenerator::new();
    generator.pass2.insert("vp engineering payments".to_string(), 85.0);
    let search = Arc::new(SharedUrlSearch {
        slow: Some("vp engineering payments".to_string()),
        ..Default::default()
    });
    let orchestrator = Arc::new(
        PipelineOrchestrator::new("cancel", Arc::new(generator), search, PipelineSettings::default())
            .with_storage(storage.clone()),
    );

    let handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start(&session_config()).await })
    };

    // Wait until the slow execution is actually in flight
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let running = orchestrator
                .query("vp engineering payments")
                .and_then(|q| q.exec_status)
                == Some(ExecStatus::Running);
            if running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("execution never started");

    assert_eq!(orchestrator.cancel_query("VP Engineering Payments"), 1);
    assert_eq!(orchestrator.cancel_query("not a query"), 0);

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        RoundOutcome::Completed {
            round: 1,
            total_unique_results: 3
        }
    );
    assert_eq!(orchestrator.stage(), PipelineStage::Complete);

    let cancelled = orchestrator.query("vp engineering payments").unwrap();
    assert_eq!(cancelled.exec_status, Some(ExecStatus::Pending));
    assert_eq!(cancelled.results_count, 0);
    assert!(cancelled.error.is_none());
    assert!(orchestrator
        .results()
        .iter()
        .all(|r| !r.source_queries.contains("VP Engineering payments")));

    let stats = orchestrator.stats();
    assert_eq!(stats.executing, 0);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);

    let session = storage.get_session("cancel").await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_running() {
    let orchestrator = PipelineOrchestrator::new(
        "invalid",
        Arc::new(RoundGenerator::new()),
        Arc::new(SharedUrlSearch::default()),
        PipelineSettings::default(),
    );

    let err = orchestrator
        .start(&session_config().with_thresholds(120.0, 60.0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("pass1_threshold"));
    assert!(!orchestrator.is_running());
    assert_eq!(orchestrator.stage(), PipelineStage::Idle);
}
