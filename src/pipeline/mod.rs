//! Agentic query pipeline.
//!
//! A session turns a persona and a seed query into a deduplicated set of
//! search results through repeated rounds:
//!
//! - **Generating**: the text generator proposes candidate queries
//! - **Pass 1**: each candidate is scored on its text alone
//! - **Pass 2**: survivors are sample-searched and the sample is scored
//! - **Executing**: queries that pass both gates run a full search
//! - **Aggregating**: results are merged by url across the session
//!
//! [`PipelineOrchestrator`] drives the state machine; the remaining modules
//! hold the pure pieces it is built from.

pub mod abort;
pub mod aggregation;
pub mod limiter;
pub mod orchestrator;
pub mod parser;
pub mod scoring;
pub mod tracker;
pub mod types;

pub use abort::{AbortRegistry, RunFlags};
pub use aggregation::ResultAggregator;
pub use limiter::ConcurrencyLimiter;
pub use orchestrator::{
    NoopObserver, PipelineObserver, PipelineOrchestrator, PipelineSettings, RoundOutcome,
};
pub use parser::{
    parse_pass1, parse_pass2, parse_query_list, ParseOutcome, Pass1Breakdown, Pass1Score,
    Pass2Breakdown, Pass2Score, QueryCandidate, PASS1_FALLBACK_SCORE, PASS2_FALLBACK_SCORE,
};
pub use scoring::{
    calculate_composite_score, clamp_score, select_top_queries_for_context, CompositeScore,
    ScoreWeights,
};
pub use tracker::{PipelineProgress, PipelineSnapshot, PipelineStats, SessionTracker};
pub use types::{
    normalize_query, AggregatedResult, ExecStatus, GeneratedQuery, PipelineStage,
    RoundHistoryEntry, ScoreStatus, SessionConfig, TopQueryContext,
};
