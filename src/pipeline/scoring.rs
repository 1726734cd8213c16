//! Score normalization.
//!
//! Pure functions: clamping the two gate scores, combining them into a
//! composite score, and picking the best prior queries to feed back into
//! generation. Misconfiguration is repaired and reported as diagnostics,
//! never raised.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::types::{GeneratedQuery, TopQueryContext};

/// Lower bound of every gate score.
pub const MIN_SCORE: f64 = 0.0;
/// Upper bound of every gate score.
pub const MAX_SCORE: f64 = 100.0;

const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Relative weights of the Pass 1 and Pass 2 scores in the composite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub pass1: f64,
    pub pass2: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            pass1: 0.3,
            pass2: 0.7,
        }
    }
}

impl ScoreWeights {
    pub fn new(pass1: f64, pass2: f64) -> Self {
        Self { pass1, pass2 }
    }

    /// Return weights that sum to 1.0, plus a diagnostic when repair was needed.
    pub fn normalized(&self) -> (ScoreWeights, Option<String>) {
        let pass1 = sanitize_weight(self.pass1);
        let pass2 = sanitize_weight(self.pass2);
        let sum = pass1 + pass2;

        if sum <= WEIGHT_TOLERANCE {
            return (
                ScoreWeights::default(),
                Some(format!(
                    "weights {{pass1: {}, pass2: {}}} have no usable mass, using defaults",
                    self.pass1, self.pass2
                )),
            );
        }

        let repaired = pass1 != self.pass1 || pass2 != self.pass2;
        if (sum - 1.0).abs() <= WEIGHT_TOLERANCE && !repaired {
            return (*self, None);
        }

        let normalized = ScoreWeights {
            pass1: pass1 / sum,
            pass2: pass2 / sum,
        };
        (
            normalized,
            Some(format!(
                "weights {{pass1: {}, pass2: {}}} renormalized to {{pass1: {:.4}, pass2: {:.4}}}",
                self.pass1, self.pass2, normalized.pass1, normalized.pass2
            )),
        )
    }
}

fn sanitize_weight(weight: f64) -> f64 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Composite score together with any repairs made while computing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub value: f64,
    pub diagnostics: Vec<String>,
}

/// Clamp a score into `[0, 100]`. NaN maps to 0.
///
/// Returns the clamped value and a diagnostic when the input was out of range.
pub fn clamp_score(score: f64, label: &str) -> (f64, Option<String>) {
    if score.is_nan() {
        return (MIN_SCORE, Some(format!("{} is NaN, clamped to 0", label)));
    }
    let clamped = score.clamp(MIN_SCORE, MAX_SCORE);
    if clamped != score {
        (
            clamped,
            Some(format!("{} {} out of range, clamped to {}", label, score, clamped)),
        )
    } else {
        (clamped, None)
    }
}

/// Weighted combination of the Pass 1 and Pass 2 scores.
///
/// Inputs are clamped to `[0, 100]` and weights renormalized to sum to 1.0.
/// The result is rounded to two decimals and is not re-clamped; it is bounded
/// by the clamped inputs.
pub fn calculate_composite_score(pass1: f64, pass2: f64, weights: ScoreWeights) -> CompositeScore {
    let mut diagnostics = Vec::new();

    let (pass1, diag) = clamp_score(pass1, "pass1 score");
    diagnostics.extend(diag);
    let (pass2, diag) = clamp_score(pass2, "pass2 score");
    diagnostics.extend(diag);
    let (weights, diag) = weights.normalized();
    diagnostics.extend(diag);

    for diagnostic in &diagnostics {
        warn!(diagnostic = %diagnostic, "Composite score input repaired");
    }

    let raw = pass1 * weights.pass1 + pass2 * weights.pass2;
    CompositeScore {
        value: (raw * 100.0).round() / 100.0,
        diagnostics,
    }
}

/// Best prior queries by composite score, for generation context.
///
/// Only queries with Pass 1, Pass 2 and composite scores all present
/// qualify. Sorted descending (ties keep input order) and truncated to
/// `limit`. The input is not modified.
pub fn select_top_queries_for_context(
    queries: &[GeneratedQuery],
    limit: usize,
) -> Vec<TopQueryContext> {
    let mut qualifying: Vec<TopQueryContext> = queries
        .iter()
        .filter_map(|q| match (q.pass1_score, q.pass2_score, q.composite_score) {
            (Some(pass1_score), Some(pass2_score), Some(composite_score)) => {
                Some(TopQueryContext {
                    query: q.query.clone(),
                    composite_score,
                    pass1_score,
                    pass2_score,
                })
            }
            _ => None,
        })
        .collect();

    qualifying.sort_by(|a, b| b.composite_score.total_cmp(&a.composite_score));
    qualifying.truncate(limit);
    qualifying
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(text: &str, composite: f64) -> GeneratedQuery {
        GeneratedQuery::new(text, "r", 1).with_scores(composite, composite, composite)
    }

    #[test]
    fn test_default_weights() {
        let score = calculate_composite_score(80.0, 90.0, ScoreWeights::default());
        assert_eq!(score.value, 87.0);
        assert!(score.diagnostics.is_empty());
    }

    #[test]
    fn test_out_of_range_pass1_is_clamped() {
        let score = calculate_composite_score(150.0, 50.0, ScoreWeights::default());
        assert_eq!(score.value, 65.0);
        assert_eq!(score.diagnostics.len(), 1);
        assert!(score.diagnostics[0].contains("pass1"));
    }

    #[test]
    fn test_negative_score_clamps_to_zero() {
        let score = calculate_composite_score(-10.0, 100.0, ScoreWeights::default());
        assert_eq!(score.value, 70.0);
    }

    #[test]
    fn test_weights_renormalize() {
        let score = calculate_composite_score(80.0, 80.0, ScoreWeights::new(0.2, 0.2));
        assert_eq!(score.value, 80.0);
        assert!(score.diagnostics.iter().any(|d| d.contains("renormalized")));

        let (weights, _) = ScoreWeights::new(0.2, 0.2).normalized();
        assert!((weights.pass1 - 0.5).abs() < 1e-12);
        assert!((weights.pass2 - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_fall_back_to_defaults() {
        let (weights, diagnostic) = ScoreWeights::new(0.0, 0.0).normalized();
        assert_eq!(weights, ScoreWeights::default());
        assert!(diagnostic.is_some());
    }

    #[test]
    fn test_select_top_queries_orders_and_limits() {
        let queries = vec![
            scored("a", 70.0),
            scored("b", 90.0),
            scored("c", 85.0),
            scored("d", 60.0),
        ];
        let top = select_top_queries_for_context(&queries, 2);
        let texts: Vec<&str> = top.iter().map(|t| t.query.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(top[0].composite_score, 90.0);
    }

    #[test]
    fn test_select_top_queries_skips_incomplete_scores() {
        let mut missing_pass2 = scored("missing", 99.0);
        missing_pass2.pass2_score = None;
        let mut missing_composite = scored("no-composite", 98.0);
        missing_composite.composite_score = None;

        let queries = vec![missing_pass2, missing_composite, scored("ok", 50.0)];
        let top = select_top_queries_for_context(&queries, 5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].query, "ok");
        assert_eq!(queries.len(), 3);
    }

    #[test]
    fn test_select_top_queries_empty_when_none_qualify() {
        let queries = vec![GeneratedQuery::new("pending", "r", 1)];
        assert!(select_top_queries_for_context(&queries, 3).is_empty());
    }
}
