//! Round-based pipeline state machine.
//!
//! One [`PipelineOrchestrator`] owns one session: generated queries, the
//! aggregated result set, round history and live stats. A round runs
//! `generating → pass1 → pass2 → executing → aggregating → complete`; each
//! stage fans its work out through a [`ConcurrencyLimiter`] and every
//! in-flight call is registered in the [`AbortRegistry`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::abort::{AbortRegistry, RunFlags};
use super::aggregation::ResultAggregator;
use super::limiter::ConcurrencyLimiter;
use super::parser::{parse_pass1, parse_pass2, parse_query_list, Pass1Score, Pass2Score};
use super::scoring::{calculate_composite_score, select_top_queries_for_context, ScoreWeights};
use super::tracker::{PipelineSnapshot, PipelineStats, SessionTracker};
use super::types::{
    normalize_query, AggregatedResult, ExecStatus, GeneratedQuery, PipelineStage,
    RoundHistoryEntry, ScoreStatus, SessionConfig, TopQueryContext,
};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::langbase::{GenerateQueriesRequest, Pass1Request, Pass2Request, TextGenerator};
use crate::search::{SearchBackend, SearchRequest, SearchResult};
use crate::storage::{SessionStatus, Storage, StoredSession};

/// Callbacks fired as a session progresses. All methods default to no-ops.
///
/// Cancellation is never reported through `on_error`.
pub trait PipelineObserver: Send + Sync {
    fn on_stage_change(&self, _stage: PipelineStage) {}

    fn on_query_updated(&self, _query: &GeneratedQuery) {}

    /// Fired once per completed round with the session-wide unique total.
    fn on_complete(&self, _total_unique_results: usize) {}

    fn on_error(&self, _message: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// How a `start`/`generate_more` call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome {
    Completed {
        round: u32,
        total_unique_results: usize,
    },
    /// `stop()` was called; no further transitions happened.
    Stopped,
    /// Another round was already running, nothing was done.
    AlreadyRunning,
}

/// Orchestrator tuning that is not part of a [`SessionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Result count for the Pass 2 sample search.
    pub sample_size: usize,
    /// Prior top queries fed back into generation.
    pub context_queries: usize,
    pub weights: ScoreWeights,
    pub country: String,
    pub language: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sample_size: 5,
            context_queries: 5,
            weights: ScoreWeights::default(),
            country: "us".to_string(),
            language: "en".to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sample_size: config.pipeline.sample_size.max(1),
            context_queries: config.pipeline.context_queries,
            weights: ScoreWeights::new(config.pipeline.weight_pass1, config.pipeline.weight_pass2),
            country: config.search.country.clone(),
            language: config.search.language.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    queries: Vec<GeneratedQuery>,
    /// Normalized query text to position in `queries`.
    index: HashMap<String, usize>,
    round: u32,
    stage: PipelineStage,
    error: Option<String>,
    history: Vec<RoundHistoryEntry>,
}

/// (normalized key, query text) for the queries a round works on.
type RoundQueries = Vec<(String, String)>;

/// Owns and drives one pipeline session.
pub struct PipelineOrchestrator {
    session_id: String,
    generator: Arc<dyn TextGenerator>,
    search: Arc<dyn SearchBackend>,
    storage: Option<Arc<dyn Storage>>,
    observer: Arc<dyn PipelineObserver>,
    settings: PipelineSettings,
    flags: Arc<RunFlags>,
    aborts: AbortRegistry,
    state: RwLock<SessionState>,
    results: Mutex<ResultAggregator>,
    tracker: SessionTracker,
    /// Held for the whole of a round, including the settling after a stop.
    round_lock: tokio::sync::Mutex<()>,
}

impl PipelineOrchestrator {
    pub fn new(
        session_id: impl Into<String>,
        generator: Arc<dyn TextGenerator>,
        search: Arc<dyn SearchBackend>,
        settings: PipelineSettings,
    ) -> Self {
        let flags = Arc::new(RunFlags::new());
        Self {
            session_id: session_id.into(),
            generator,
            search,
            storage: None,
            observer: Arc::new(NoopObserver),
            settings,
            aborts: AbortRegistry::new(flags.clone()),
            flags,
            state: RwLock::new(SessionState::default()),
            results: Mutex::new(ResultAggregator::new()),
            tracker: SessionTracker::new(),
            round_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Persist progress to `storage` (best-effort).
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    // ------------------------------------------------------------------
    // Controls
    // ------------------------------------------------------------------

    /// Reset the session and run round 1. No-op if a round is running.
    pub async fn start(&self, config: &SessionConfig) -> PipelineResult<RoundOutcome> {
        config.validate()?;
        if !self.flags.try_start() {
            debug!(session_id = %self.session_id, "Start ignored, pipeline already running");
            return Ok(RoundOutcome::AlreadyRunning);
        }
        let _round = self.round_lock.lock().await;

        self.reset();
        self.persist_session(config).await;
        self.run_round(config, 1).await
    }

    /// Run the next round on top of the existing session. No-op if running.
    pub async fn generate_more(&self, config: &SessionConfig) -> PipelineResult<RoundOutcome> {
        config.validate()?;
        if !self.flags.try_start() {
            debug!(session_id = %self.session_id, "Generate more ignored, pipeline already running");
            return Ok(RoundOutcome::AlreadyRunning);
        }
        let _round = self.round_lock.lock().await;

        let round = self.state.read().round + 1;
        if round == 1 {
            self.persist_session(config).await;
        }
        self.run_round(config, round).await
    }

    /// Hold the round at the next stage boundary.
    ///
    /// Returns false when not running, already paused, or outside a pausable
    /// stage. In-flight calls of the current stage are left to finish.
    pub fn pause(&self) -> bool {
        if !self.flags.is_running() || self.flags.is_paused() || !self.stage().is_pausable() {
            return false;
        }
        self.flags.set_paused(true);
        self.tracker.set_flags(true, true);
        info!(session_id = %self.session_id, stage = %self.stage(), "Pause requested");
        true
    }

    /// Returns false when the pipeline was not paused.
    pub fn resume(&self) -> bool {
        if !self.flags.is_paused() {
            return false;
        }
        self.flags.set_paused(false);
        self.tracker.set_flags(self.flags.is_running(), false);
        info!(session_id = %self.session_id, "Resume requested");
        true
    }

    /// Cancel everything in flight and clear the running/paused flags.
    ///
    /// The current stage is left as is. Returns the number of cancelled
    /// operations.
    pub fn stop(&self) -> usize {
        let cancelled = self.aborts.cancel_all();
        self.tracker.set_flags(false, false);
        info!(session_id = %self.session_id, cancelled, "Pipeline stop requested");
        cancelled
    }

    /// Cancel every in-flight operation for one query.
    ///
    /// The query keeps its last finalized status. Returns the number of
    /// cancelled operations; unknown queries are a no-op.
    pub fn cancel_query(&self, query: &str) -> usize {
        let key = normalize_query(query);
        let cancelled = self
            .aborts
            .cancel_where(|id| id.split_once(':').is_some_and(|(_, op_key)| op_key == key));
        if cancelled > 0 {
            info!(session_id = %self.session_id, query = %key, cancelled, "Query cancelled");
        }
        cancelled
    }

    // ------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.flags.is_paused()
    }

    pub fn stage(&self) -> PipelineStage {
        self.state.read().stage
    }

    pub fn round(&self) -> u32 {
        self.state.read().round
    }

    /// Message of the last unrecoverable failure, cleared when a round starts.
    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.tracker.stats()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.tracker.snapshot()
    }

    /// Receiver that sees every stats/progress change.
    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.tracker.subscribe()
    }

    pub fn queries(&self) -> Vec<GeneratedQuery> {
        self.state.read().queries.clone()
    }

    pub fn query(&self, text: &str) -> Option<GeneratedQuery> {
        let state = self.state.read();
        state
            .index
            .get(&normalize_query(text))
            .map(|&position| state.queries[position].clone())
    }

    pub fn results(&self) -> Vec<AggregatedResult> {
        self.results.lock().results().to_vec()
    }

    pub fn total_unique_results(&self) -> usize {
        self.results.lock().len()
    }

    pub fn history(&self) -> Vec<RoundHistoryEntry> {
        self.state.read().history.clone()
    }

    pub fn top_queries(&self, limit: usize) -> Vec<TopQueryContext> {
        select_top_queries_for_context(&self.state.read().queries, limit)
    }

    // ------------------------------------------------------------------
    // Round execution
    // ------------------------------------------------------------------

    fn reset(&self) {
        *self.state.write() = SessionState::default();
        self.results.lock().clear();
        self.tracker.reset();
    }

    async fn run_round(&self, config: &SessionConfig, round: u32) -> PipelineResult<RoundOutcome> {
        let round_id = format!("round-{}", round);
        let token = self.aborts.register(round_id.clone(), &CancellationToken::new());
        {
            let mut state = self.state.write();
            state.round = round;
            state.error = None;
        }
        self.tracker.set_round(round);
        self.tracker.set_flags(true, self.flags.is_paused());
        info!(session_id = %self.session_id, round, "Pipeline round started");

        let outcome = self.execute_round(config, round, &token).await;
        self.aborts.remove(&round_id);

        if matches!(outcome, Ok(RoundOutcome::Stopped)) {
            self.settle_stopped(round).await;
        }
        outcome
    }

    async fn execute_round(
        &self,
        config: &SessionConfig,
        round: u32,
        token: &CancellationToken,
    ) -> PipelineResult<RoundOutcome> {
        let limiter = ConcurrencyLimiter::new(config.concurrency_limit);

        if token.is_cancelled() || !self.flags.is_running() {
            return Ok(RoundOutcome::Stopped);
        }
        self.set_stage(PipelineStage::Generating, 1);
        let generated = match self.generate(config, round, token).await {
            Ok(Some(generated)) => generated,
            Ok(None) => return Ok(RoundOutcome::Stopped),
            Err(message) => {
                self.fail(&message).await;
                return Err(PipelineError::Generation { message });
            }
        };

        if !self.checkpoint(token).await {
            return Ok(RoundOutcome::Stopped);
        }
        self.set_stage(PipelineStage::Pass1, generated.len());
        let units: Vec<BoxFuture<'_, ()>> = generated
            .iter()
            .map(|(key, text)| self.score_pass1(config, key, text, token).boxed())
            .collect();
        limiter.run(units, token).await;

        if !self.checkpoint(token).await {
            return Ok(RoundOutcome::Stopped);
        }
        let survivors = self.schedule_pass2(round);
        self.set_stage(PipelineStage::Pass2, survivors.len());
        let units: Vec<BoxFuture<'_, ()>> = survivors
            .iter()
            .map(|(key, text)| self.score_pass2(config, key, text, token).boxed())
            .collect();
        limiter.run(units, token).await;

        if !self.checkpoint(token).await {
            return Ok(RoundOutcome::Stopped);
        }
        let executable = self.schedule_execution(&survivors);
        self.set_stage(PipelineStage::Executing, executable.len());
        let units: Vec<BoxFuture<'_, Option<(String, Vec<SearchResult>)>>> = executable
            .iter()
            .map(|(key, text)| self.execute_query(config, key, text, token).boxed())
            .collect();
        let batches = limiter.run(units, token).await;

        if token.is_cancelled() || !self.flags.is_running() {
            return Ok(RoundOutcome::Stopped);
        }
        let batches: Vec<(String, Vec<SearchResult>)> = batches.into_iter().flatten().collect();
        self.set_stage(PipelineStage::Aggregating, batches.len());
        for (query, results) in batches {
            let added = self.results.lock().merge(&query, results);
            self.tracker.advance(|_| {});
            debug!(session_id = %self.session_id, query = %query, added, "Results merged");
        }
        let total_unique_results = self.total_unique_results();

        let entry = self.record_round(round, &generated);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.append_round(&self.session_id, &entry).await {
                warn!(session_id = %self.session_id, round, error = %e, "Failed to persist round history");
            }
        }

        self.set_stage(PipelineStage::Complete, 0);
        self.persist_status(SessionStatus::Completed, None).await;
        self.flags.clear();
        self.tracker.set_flags(false, false);
        self.observer.on_complete(total_unique_results);

        info!(
            session_id = %self.session_id,
            round,
            generated = entry.queries_generated,
            passed_pass1 = entry.queries_passed_pass1,
            passed_pass2 = entry.queries_passed_pass2,
            total_unique_results,
            "Pipeline round completed"
        );

        Ok(RoundOutcome::Completed {
            round,
            total_unique_results,
        })
    }

    /// Ask for candidates and add the new ones to the session.
    ///
    /// `Ok(None)` means the call was cancelled; `Err` carries the failure
    /// message of an unreachable generator.
    async fn generate(
        &self,
        config: &SessionConfig,
        round: u32,
        token: &CancellationToken,
    ) -> Result<Option<RoundQueries>, String> {
        let top_queries_context =
            select_top_queries_for_context(&self.state.read().queries, self.settings.context_queries);
        let request = GenerateQueriesRequest {
            persona: config.persona.clone(),
            seed_query: config.seed_query.clone(),
            round,
            count: config.query_budget_per_round,
            top_queries_context,
        };

        let op_id = format!("generating-{}", round);
        let op = self.aborts.register(op_id.clone(), token);
        let response = guarded(&op, self.generator.generate_queries(&request)).await;
        self.aborts.remove(&op_id);

        let completion = match response {
            Some(Ok(completion)) if !op.is_cancelled() => completion,
            Some(Err(e)) => return Err(e.to_string()),
            _ => return Ok(None),
        };

        let candidates = parse_query_list(&completion).into_value();
        let offered = candidates.len();
        let fresh: Vec<GeneratedQuery> = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let mut fresh = Vec::new();
            for candidate in candidates {
                if fresh.len() >= config.query_budget_per_round {
                    break;
                }
                let query = GeneratedQuery::new(candidate.query, candidate.reasoning, round);
                let key = query.key();
                if state.index.contains_key(&key) {
                    debug!(query = %key, "Dropping query already seen this session");
                    continue;
                }
                state.index.insert(key, state.queries.len());
                state.queries.push(query.clone());
                fresh.push(query);
            }
            fresh
        };

        self.tracker.advance(|stats| stats.record_generated(fresh.len()));
        info!(
            session_id = %self.session_id,
            round,
            offered,
            generated = fresh.len(),
            "Queries generated"
        );

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.insert_queries(&self.session_id, &fresh).await {
                warn!(session_id = %self.session_id, error = %e, "Failed to persist generated queries");
            }
        }
        for query in &fresh {
            self.observer.on_query_updated(query);
        }

        Ok(Some(fresh.iter().map(|q| (q.key(), q.query.clone())).collect()))
    }

    async fn score_pass1(
        &self,
        config: &SessionConfig,
        key: &str,
        text: &str,
        token: &CancellationToken,
    ) {
        let request = Pass1Request {
            query: text.to_string(),
            persona: config.persona.clone(),
            scoring_instructions: config.scoring_instructions.clone(),
        };

        let op_id = format!("{}:{}", PipelineStage::Pass1, key);
        let op = self.aborts.register(op_id.clone(), token);
        let response = guarded(&op, self.generator.score_pass1(&request)).await;
        self.aborts.remove(&op_id);

        let score = match response {
            Some(Ok(completion)) if !op.is_cancelled() => parse_pass1(&completion).into_value(),
            Some(Err(e)) if !op.is_cancelled() => {
                warn!(query = %text, error = %e, "Pass 1 request failed, using fallback score");
                Pass1Score::fallback(&e.to_string())
            }
            _ => {
                debug!(query = %text, "Pass 1 cancelled, result discarded");
                return;
            }
        };

        let status = ScoreStatus::from_threshold(score.score, config.pass1_threshold);
        let updated = self.update_query(key, |query| {
            query.pass1_score = Some(score.score);
            query.pass1_status = status;
            query.pass1_reasoning = Some(score.reasoning);
        });
        self.tracker
            .advance(|stats| stats.record_pass1(status == ScoreStatus::Passed));
        debug!(query = %text, score = score.score, status = %status, "Pass 1 scored");

        if let Some(query) = updated {
            self.publish(&query).await;
        }
    }

    /// Queue every Pass 1 survivor that has no Pass 2 status yet.
    ///
    /// Survivors of a round stopped before its Pass 2 are picked up here too.
    fn schedule_pass2(&self, round: u32) -> RoundQueries {
        let mut carried = 0;
        let survivors: RoundQueries = {
            let mut state = self.state.write();
            state
                .queries
                .iter_mut()
                .filter(|q| q.pass1_status == ScoreStatus::Passed && q.pass2_status.is_none())
                .map(|query| {
                    if query.round < round {
                        carried += 1;
                    }
                    query.pass2_status = Some(ScoreStatus::Pending);
                    (query.key(), query.query.clone())
                })
                .collect()
        };
        if carried > 0 {
            debug!(session_id = %self.session_id, round, carried, "Earlier Pass 1 survivors queued for Pass 2");
        }
        self.tracker
            .update_stats(|stats| stats.schedule_pass2(survivors.len()));
        survivors
    }

    async fn score_pass2(
        &self,
        config: &SessionConfig,
        key: &str,
        text: &str,
        token: &CancellationToken,
    ) {
        let op_id = format!("{}:{}", PipelineStage::Pass2, key);
        let op = self.aborts.register(op_id.clone(), token);
        let outcome = guarded(&op, self.validate_sample(config, text)).await;
        self.aborts.remove(&op_id);

        let outcome = match outcome {
            Some(outcome) if !op.is_cancelled() => outcome,
            _ => {
                debug!(query = %text, "Pass 2 cancelled, result discarded");
                return;
            }
        };

        let weights = self.settings.weights;
        let (updated, passed) = match outcome {
            Ok(score) => {
                let status = ScoreStatus::from_threshold(score.score, config.pass2_threshold);
                let updated = self.update_query(key, |query| {
                    query.pass2_score = Some(score.score);
                    query.pass2_status = Some(status);
                    query.pass2_reasoning = Some(score.reasoning);
                    if status == ScoreStatus::Passed {
                        if let Some(pass1) = query.pass1_score {
                            query.composite_score =
                                Some(calculate_composite_score(pass1, score.score, weights).value);
                        }
                    }
                });
                debug!(query = %text, score = score.score, status = %status, "Pass 2 scored");
                (updated, status == ScoreStatus::Passed)
            }
            Err(message) => {
                warn!(query = %text, error = %message, "Pass 2 sample search failed");
                let updated = self.update_query(key, |query| {
                    query.pass2_status = Some(ScoreStatus::Failed);
                    query.error = Some(message);
                });
                (updated, false)
            }
        };
        self.tracker.advance(|stats| stats.record_pass2(passed));

        if let Some(query) = updated {
            self.publish(&query).await;
        }
    }

    /// Sample-search a query and score the sample.
    ///
    /// A failed search is an error; a failed scoring call degrades to the
    /// Pass 2 fallback score.
    async fn validate_sample(&self, config: &SessionConfig, text: &str) -> Result<Pass2Score, String> {
        let sample = self
            .search
            .search(self.search_request(text, self.settings.sample_size))
            .await
            .map_err(|e| e.to_string())?;

        let request = Pass2Request {
            query: text.to_string(),
            sampled_results: sample.results,
            persona: config.persona.clone(),
            scoring_instructions: config.scoring_instructions.clone(),
        };

        Ok(match self.generator.score_pass2(&request).await {
            Ok(completion) => parse_pass2(&completion).into_value(),
            Err(e) => {
                warn!(query = %text, error = %e, "Pass 2 request failed, using fallback score");
                Pass2Score::fallback(&e.to_string())
            }
        })
    }

    fn schedule_execution(&self, survivors: &[(String, String)]) -> RoundQueries {
        let executable = self.select(survivors, |q| q.pass2_status == Some(ScoreStatus::Passed));
        for (key, _) in &executable {
            self.update_query(key, |query| query.exec_status = Some(ExecStatus::Pending));
        }
        executable
    }

    async fn execute_query(
        &self,
        config: &SessionConfig,
        key: &str,
        text: &str,
        token: &CancellationToken,
    ) -> Option<(String, Vec<SearchResult>)> {
        let op_id = format!("{}:{}", PipelineStage::Executing, key);
        let op = self.aborts.register(op_id.clone(), token);

        let running = self.update_query(key, |query| query.exec_status = Some(ExecStatus::Running));
        self.tracker.update_stats(|stats| stats.start_execution());
        if let Some(query) = running {
            self.publish(&query).await;
        }

        let request = self.search_request(text, config.max_results_per_query);
        let response = guarded(&op, self.search.search(request)).await;
        self.aborts.remove(&op_id);

        let response = match response {
            Some(response) if !op.is_cancelled() => response,
            _ => {
                debug!(query = %text, "Execution cancelled, result discarded");
                self.revert_running(Some(key));
                if let Some(query) = self.query(text) {
                    self.publish(&query).await;
                }
                return None;
            }
        };

        match response {
            Ok(response) => {
                let results = response.results;
                let count = results.len();
                let updated = self.update_query(key, |query| {
                    query.exec_status = Some(ExecStatus::Completed);
                    query.results_count = count;
                });
                self.tracker.advance(|stats| stats.finish_execution(true));
                debug!(query = %text, results = count, "Query executed");
                if let Some(query) = updated {
                    self.publish(&query).await;
                }
                Some((text.to_string(), results))
            }
            Err(e) => {
                warn!(query = %text, error = %e, "Query execution failed");
                let updated = self.update_query(key, |query| {
                    query.exec_status = Some(ExecStatus::Error);
                    query.error = Some(e.to_string());
                });
                self.tracker.advance(|stats| stats.finish_execution(false));
                if let Some(query) = updated {
                    self.publish(&query).await;
                }
                None
            }
        }
    }

    /// Wait out a pause. Returns false once the round has been stopped.
    async fn checkpoint(&self, token: &CancellationToken) -> bool {
        if token.is_cancelled() || !self.flags.is_running() {
            return false;
        }
        if self.flags.is_paused() {
            info!(session_id = %self.session_id, stage = %self.stage(), "Pipeline paused at stage boundary");
            self.persist_status(SessionStatus::Paused, None).await;
            if !self.flags.wait_while_paused(token).await {
                return false;
            }
            info!(session_id = %self.session_id, "Pipeline resumed");
            self.persist_status(SessionStatus::Running, None).await;
        }
        !token.is_cancelled() && self.flags.is_running()
    }

    // ------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------

    fn set_stage(&self, stage: PipelineStage, total: usize) {
        self.state.write().stage = stage;
        self.tracker.enter_stage(stage, total);
        self.observer.on_stage_change(stage);
        debug!(session_id = %self.session_id, stage = %stage, total, "Stage entered");
    }

    fn update_query(
        &self,
        key: &str,
        update: impl FnOnce(&mut GeneratedQuery),
    ) -> Option<GeneratedQuery> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let position = *state.index.get(key)?;
        let query = &mut state.queries[position];
        update(query);
        Some(query.clone())
    }

    fn select(
        &self,
        candidates: &[(String, String)],
        predicate: impl Fn(&GeneratedQuery) -> bool,
    ) -> RoundQueries {
        let state = self.state.read();
        candidates
            .iter()
            .filter(|(key, _)| {
                state
                    .index
                    .get(key)
                    .is_some_and(|&position| predicate(&state.queries[position]))
            })
            .cloned()
            .collect()
    }

    /// Put `running` executions back to `pending`, for one query or all.
    fn revert_running(&self, only: Option<&str>) {
        let reverted = {
            let mut state = self.state.write();
            let mut reverted = 0;
            for query in state.queries.iter_mut() {
                let matches = only.map_or(true, |key| query.key() == key);
                if matches && query.exec_status == Some(ExecStatus::Running) {
                    query.exec_status = Some(ExecStatus::Pending);
                    reverted += 1;
                }
            }
            reverted
        };
        if reverted > 0 {
            self.tracker.update_stats(|stats| {
                for _ in 0..reverted {
                    stats.abandon_execution();
                }
            });
        }
    }

    fn record_round(&self, round: u32, generated: &[(String, String)]) -> RoundHistoryEntry {
        let mut state = self.state.write();
        let mut passed_pass1 = 0;
        let mut passed_pass2 = 0;
        let mut composites = Vec::new();
        for (key, _) in generated {
            let Some(&position) = state.index.get(key) else {
                continue;
            };
            let query = &state.queries[position];
            if query.pass1_status == ScoreStatus::Passed {
                passed_pass1 += 1;
            }
            if query.pass2_status == Some(ScoreStatus::Passed) {
                passed_pass2 += 1;
            }
            composites.extend(query.composite_score);
        }

        let avg_composite_score = if composites.is_empty() {
            None
        } else {
            let mean = composites.iter().sum::<f64>() / composites.len() as f64;
            Some((mean * 100.0).round() / 100.0)
        };

        let entry = RoundHistoryEntry {
            round,
            queries_generated: generated.len(),
            queries_passed_pass1: passed_pass1,
            queries_passed_pass2: passed_pass2,
            avg_composite_score,
            timestamp: chrono::Utc::now(),
        };
        state.history.push(entry.clone());
        entry
    }

    /// Unrecoverable failure: enter `error`, keep prior results.
    async fn fail(&self, message: &str) {
        {
            let mut state = self.state.write();
            state.stage = PipelineStage::Error;
            state.error = Some(message.to_string());
        }
        self.tracker.enter_stage(PipelineStage::Error, 0);
        self.tracker.set_error(message);
        self.flags.clear();
        self.tracker.set_flags(false, false);
        self.observer.on_stage_change(PipelineStage::Error);
        self.observer.on_error(message);
        error!(session_id = %self.session_id, error = %message, "Pipeline round failed");
        self.persist_status(SessionStatus::Error, Some(message)).await;
    }

    async fn settle_stopped(&self, round: u32) {
        self.revert_running(None);
        self.tracker.set_flags(false, false);
        self.tracker.set_message(format!("Stopped during {}", self.stage()));
        info!(session_id = %self.session_id, round, stage = %self.stage(), "Pipeline round stopped");
        self.persist_status(SessionStatus::Stopped, None).await;
    }

    fn search_request(&self, query: &str, max_results: usize) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            country: self.settings.country.clone(),
            language: self.settings.language.clone(),
            max_results,
        }
    }

    // ------------------------------------------------------------------
    // Best-effort persistence
    // ------------------------------------------------------------------

    async fn publish(&self, query: &GeneratedQuery) {
        self.observer.on_query_updated(query);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.update_query(&self.session_id, query).await {
                warn!(session_id = %self.session_id, query = %query.query, error = %e, "Failed to persist query update");
            }
        }
    }

    async fn persist_session(&self, config: &SessionConfig) {
        if let Some(storage) = &self.storage {
            let session = StoredSession::new(config.clone()).with_id(&self.session_id);
            if let Err(e) = storage.save_session(&session).await {
                warn!(session_id = %self.session_id, error = %e, "Failed to persist session");
            }
        }
    }

    async fn persist_status(&self, status: SessionStatus, error: Option<&str>) {
        if let Some(storage) = &self.storage {
            let round = self.round();
            if let Err(e) = storage
                .update_session_status(&self.session_id, status, round, error)
                .await
            {
                warn!(session_id = %self.session_id, status = %status, error = %e, "Failed to persist session status");
            }
        }
    }
}

/// Run `future` unless `token` is cancelled first.
async fn guarded<F: Future>(token: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = future => Some(output),
    }
}
