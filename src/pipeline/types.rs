use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineDefaults;
use crate::error::{PipelineError, PipelineResult};
use crate::search::SearchResult;

/// Caller-owned configuration for one pipeline session.
///
/// Treated as immutable for the duration of a round; the orchestrator takes
/// it by reference on every `start`/`generate_more` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Free-text description of the target profile.
    pub persona: String,
    /// Initial query used to bootstrap generation.
    pub seed_query: String,
    /// Extra guidance forwarded to both scoring passes.
    #[serde(default)]
    pub scoring_instructions: String,
    pub pass1_threshold: f64,
    pub pass2_threshold: f64,
    pub query_budget_per_round: usize,
    pub concurrency_limit: usize,
    pub max_results_per_query: usize,
}

impl SessionConfig {
    /// Build a config from the persona/seed pair and the configured defaults.
    pub fn from_defaults(
        persona: impl Into<String>,
        seed_query: impl Into<String>,
        defaults: &PipelineDefaults,
    ) -> Self {
        Self {
            persona: persona.into(),
            seed_query: seed_query.into(),
            scoring_instructions: String::new(),
            pass1_threshold: defaults.pass1_threshold,
            pass2_threshold: defaults.pass2_threshold,
            query_budget_per_round: defaults.query_budget_per_round,
            concurrency_limit: defaults.concurrency_limit,
            max_results_per_query: defaults.max_results_per_query,
        }
    }

    pub fn with_scoring_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.scoring_instructions = instructions.into();
        self
    }

    pub fn with_thresholds(mut self, pass1: f64, pass2: f64) -> Self {
        self.pass1_threshold = pass1;
        self.pass2_threshold = pass2;
        self
    }

    pub fn with_budget(mut self, queries_per_round: usize) -> Self {
        self.query_budget_per_round = queries_per_round;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results_per_query = max_results;
        self
    }

    /// Reject configs the pipeline cannot run with.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.persona.trim().is_empty() {
            return Err(validation("persona", "cannot be empty"));
        }
        for (field, value) in [
            ("pass1_threshold", self.pass1_threshold),
            ("pass2_threshold", self.pass2_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(validation(field, "must be between 0 and 100"));
            }
        }
        for (field, value) in [
            ("query_budget_per_round", self.query_budget_per_round),
            ("concurrency_limit", self.concurrency_limit),
            ("max_results_per_query", self.max_results_per_query),
        ] {
            if value < 1 {
                return Err(validation(field, "must be at least 1"));
            }
        }
        Ok(())
    }
}

fn validation(field: &str, reason: &str) -> PipelineError {
    PipelineError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Outcome of a scoring gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl ScoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreStatus::Pending => "pending",
            ScoreStatus::Passed => "passed",
            ScoreStatus::Failed => "failed",
        }
    }

    /// Gate a score against a threshold (inclusive).
    pub fn from_threshold(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            ScoreStatus::Passed
        } else {
            ScoreStatus::Failed
        }
    }
}

impl std::fmt::Display for ScoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ScoreStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ScoreStatus::Pending),
            "passed" => Ok(ScoreStatus::Passed),
            "failed" => Ok(ScoreStatus::Failed),
            _ => Err(format!("Unknown score status: {}", s)),
        }
    }
}

/// Execution status of a query that cleared both gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Pending => "pending",
            ExecStatus::Running => "running",
            ExecStatus::Completed => "completed",
            ExecStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecStatus::Pending),
            "running" => Ok(ExecStatus::Running),
            "completed" => Ok(ExecStatus::Completed),
            "error" => Ok(ExecStatus::Error),
            _ => Err(format!("Unknown exec status: {}", s)),
        }
    }
}

/// Case-folded, trimmed query text used as the query identity.
pub fn normalize_query(text: &str) -> String {
    text.trim().to_lowercase()
}

/// A candidate query and everything the pipeline learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    /// Query text as generated (trimmed).
    pub query: String,
    /// Round that produced this query.
    pub round: u32,
    /// Generator's explanation for the query.
    pub reasoning: String,
    pub pass1_score: Option<f64>,
    pub pass1_status: ScoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass1_reasoning: Option<String>,
    /// Absent until Pass 1 passes.
    pub pass2_score: Option<f64>,
    pub pass2_status: Option<ScoreStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass2_reasoning: Option<String>,
    /// Present only once both pass scores exist and Pass 2 passed.
    pub composite_score: Option<f64>,
    pub exec_status: Option<ExecStatus>,
    pub results_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GeneratedQuery {
    pub fn new(query: impl Into<String>, reasoning: impl Into<String>, round: u32) -> Self {
        Self {
            query: query.into().trim().to_string(),
            round,
            reasoning: reasoning.into(),
            pass1_score: None,
            pass1_status: ScoreStatus::Pending,
            pass1_reasoning: None,
            pass2_score: None,
            pass2_status: None,
            pass2_reasoning: None,
            composite_score: None,
            exec_status: None,
            results_count: 0,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Identity key within a session.
    pub fn key(&self) -> String {
        normalize_query(&self.query)
    }

    /// Set all three scores at once; used for restoring and in tests.
    pub fn with_scores(mut self, pass1: f64, pass2: f64, composite: f64) -> Self {
        self.pass1_score = Some(pass1);
        self.pass1_status = ScoreStatus::Passed;
        self.pass2_score = Some(pass2);
        self.pass2_status = Some(ScoreStatus::Passed);
        self.composite_score = Some(composite);
        self
    }
}

/// A search hit merged across every query and round that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    #[serde(flatten)]
    pub result: SearchResult,
    /// Query texts that returned this url.
    pub source_queries: BTreeSet<String>,
    pub first_seen_at: DateTime<Utc>,
}

/// Summary of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundHistoryEntry {
    pub round: u32,
    pub queries_generated: usize,
    pub queries_passed_pass1: usize,
    pub queries_passed_pass2: usize,
    pub avg_composite_score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Prior high-scoring query fed back into generation.
///
/// Carries only these four fields so nothing else leaks into prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopQueryContext {
    pub query: String,
    pub composite_score: f64,
    pub pass1_score: f64,
    pub pass2_score: f64,
}

/// Stage of the pipeline state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    Generating,
    Pass1,
    Pass2,
    Executing,
    Aggregating,
    Complete,
    Error,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Generating => "generating",
            PipelineStage::Pass1 => "pass1",
            PipelineStage::Pass2 => "pass2",
            PipelineStage::Executing => "executing",
            PipelineStage::Aggregating => "aggregating",
            PipelineStage::Complete => "complete",
            PipelineStage::Error => "error",
        }
    }

    /// Stages during which `pause()` has an effect.
    pub fn is_pausable(&self) -> bool {
        matches!(
            self,
            PipelineStage::Generating
                | PipelineStage::Pass1
                | PipelineStage::Pass2
                | PipelineStage::Executing
        )
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(PipelineStage::Idle),
            "generating" => Ok(PipelineStage::Generating),
            "pass1" => Ok(PipelineStage::Pass1),
            "pass2" => Ok(PipelineStage::Pass2),
            "executing" => Ok(PipelineStage::Executing),
            "aggregating" => Ok(PipelineStage::Aggregating),
            "complete" => Ok(PipelineStage::Complete),
            "error" => Ok(PipelineStage::Error),
            _ => Err(format!("Unknown pipeline stage: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::from_defaults("Fintech CTO", "cto fintech", &PipelineDefaults::default())
    }

    #[test]
    fn test_normalize_query_folds_case_and_trims() {
        assert_eq!(normalize_query("  CTO Fintech "), "cto fintech");
        assert_eq!(
            GeneratedQuery::new(" VP Sales ", "", 1).key(),
            normalize_query("vp sales")
        );
    }

    #[test]
    fn test_generated_query_starts_pending() {
        let q = GeneratedQuery::new("cto", "reason", 2);
        assert_eq!(q.round, 2);
        assert_eq!(q.pass1_status, ScoreStatus::Pending);
        assert!(q.pass2_status.is_none());
        assert!(q.composite_score.is_none());
        assert!(q.exec_status.is_none());
    }

    #[test]
    fn test_threshold_gate_is_inclusive() {
        assert_eq!(ScoreStatus::from_threshold(70.0, 70.0), ScoreStatus::Passed);
        assert_eq!(ScoreStatus::from_threshold(65.0, 70.0), ScoreStatus::Failed);
    }

    #[test]
    fn test_session_config_validation() {
        assert!(config().validate().is_ok());

        let err = config().with_thresholds(120.0, 50.0).validate().unwrap_err();
        assert!(err.to_string().contains("pass1_threshold"));

        let err = config().with_concurrency(0).validate().unwrap_err();
        assert!(err.to_string().contains("concurrency_limit"));

        let mut blank = config();
        blank.persona = "  ".to_string();
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_stage_round_trip() {
        for stage in [
            PipelineStage::Idle,
            PipelineStage::Pass2,
            PipelineStage::Aggregating,
            PipelineStage::Error,
        ] {
            assert_eq!(stage.as_str().parse::<PipelineStage>().unwrap(), stage);
        }
        assert!(PipelineStage::Executing.is_pausable());
        assert!(!PipelineStage::Aggregating.is_pausable());
    }
}
