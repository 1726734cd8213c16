//! Typed parsing of free-form text-generation output.
//!
//! Every parser returns a [`ParseOutcome`]: either the value that was read
//! (possibly with repair warnings) or a documented fallback value with the
//! reason parsing failed. Nothing here returns an error; malformed output
//! degrades to values that fail downstream threshold gates.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::scoring::clamp_score;
use super::types::normalize_query;

/// Pass 1 fallback score; low enough to fail any reasonable threshold.
pub const PASS1_FALLBACK_SCORE: f64 = 20.0;
/// Pass 2 fallback score.
pub const PASS2_FALLBACK_SCORE: f64 = 15.0;

/// Result of parsing model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome<T> {
    /// The response was understood. `warnings` lists non-fatal repairs.
    Parsed { value: T, warnings: Vec<String> },
    /// The response was unusable and `value` is the documented default.
    Fallback { value: T, diagnostic: String },
}

impl<T> ParseOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            ParseOutcome::Parsed { value, .. } | ParseOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            ParseOutcome::Parsed { value, .. } | ParseOutcome::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ParseOutcome::Fallback { .. })
    }

    /// Every warning or fallback reason attached to this outcome.
    pub fn diagnostics(&self) -> Vec<&str> {
        match self {
            ParseOutcome::Parsed { warnings, .. } => warnings.iter().map(String::as_str).collect(),
            ParseOutcome::Fallback { diagnostic, .. } => vec![diagnostic.as_str()],
        }
    }

    fn parsed(value: T, warnings: Vec<String>, context: &str) -> Self {
        for warning in &warnings {
            warn!(context = %context, diagnostic = %warning, "Model response repaired");
        }
        ParseOutcome::Parsed { value, warnings }
    }

    fn fallback(value: T, diagnostic: String, completion: &str, context: &str) -> Self {
        warn!(
            context = %context,
            diagnostic = %diagnostic,
            completion_preview = %completion.chars().take(200).collect::<String>(),
            "Failed to parse model response, using fallback"
        );
        ParseOutcome::Fallback { value, diagnostic }
    }
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Tries raw JSON first, then a ```json fenced block, then any ``` block.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

// ============================================================================
// Query list
// ============================================================================

/// One query proposed by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCandidate {
    pub query: String,
    pub reasoning: String,
}

const MISSING_REASONING: &str = "No reasoning provided";

/// Parse an array of `{query, reasoning}` objects.
///
/// Bad entries are skipped individually. Duplicate query text (trimmed,
/// case-insensitive) keeps the first occurrence. Text that is not JSON at
/// all goes through a regex salvage pass before giving up.
pub fn parse_query_list(completion: &str) -> ParseOutcome<Vec<QueryCandidate>> {
    const CONTEXT: &str = "query_list";

    let parsed = extract_json_from_completion(completion)
        .and_then(|json| serde_json::from_str::<Value>(json).map_err(|e| e.to_string()));

    let value = match parsed {
        Ok(value) => value,
        Err(reason) => return salvage_query_list(completion, &reason),
    };

    let Value::Array(entries) = value else {
        return ParseOutcome::fallback(
            Vec::new(),
            format!("expected a JSON array of queries, got {}", json_kind(&value)),
            completion,
            CONTEXT,
        );
    };

    let mut warnings = Vec::new();
    let candidates = collect_candidates(entries.iter(), &mut warnings);
    ParseOutcome::parsed(candidates, warnings, CONTEXT)
}

fn collect_candidates<'a>(
    entries: impl Iterator<Item = &'a Value>,
    warnings: &mut Vec<String>,
) -> Vec<QueryCandidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for (index, entry) in entries.enumerate() {
        let Some(candidate) = read_candidate(index, entry, warnings) else {
            continue;
        };
        if !seen.insert(normalize_query(&candidate.query)) {
            warnings.push(format!(
                "entry {}: duplicate query '{}' skipped",
                index, candidate.query
            ));
            continue;
        }
        candidates.push(candidate);
    }

    candidates
}

fn read_candidate(index: usize, entry: &Value, warnings: &mut Vec<String>) -> Option<QueryCandidate> {
    let Some(object) = entry.as_object() else {
        warnings.push(format!("entry {}: expected an object, skipped", index));
        return None;
    };

    let query = match object.get("query") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => {
            warnings.push(format!("entry {}: missing or empty query, skipped", index));
            return None;
        }
    };

    let reasoning = match object.get("reasoning") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        None | Some(Value::Null) | Some(Value::String(_)) => {
            warnings.push(format!("entry {}: missing reasoning for '{}'", index, query));
            MISSING_REASONING.to_string()
        }
        Some(other) => {
            warnings.push(format!(
                "entry {}: reasoning must be a string, got {}, skipped",
                index,
                json_kind(other)
            ));
            return None;
        }
    };

    Some(QueryCandidate { query, reasoning })
}

fn object_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{[^{}]*\}").ok()).as_ref()
}

fn field_pattern(field: &'static str) -> Option<&'static Regex> {
    static QUERY: OnceLock<Option<Regex>> = OnceLock::new();
    static REASONING: OnceLock<Option<Regex>> = OnceLock::new();
    let cell = if field == "query" { &QUERY } else { &REASONING };
    cell.get_or_init(|| Regex::new(&format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, field)).ok())
        .as_ref()
}

fn capture_string_field(chunk: &str, field: &'static str) -> Option<String> {
    let raw = field_pattern(field)?.captures(chunk)?.get(1)?.as_str();
    Some(serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string()))
}

/// Best-effort recovery of `{query, reasoning}` objects from broken JSON.
fn salvage_query_list(completion: &str, reason: &str) -> ParseOutcome<Vec<QueryCandidate>> {
    const CONTEXT: &str = "query_list";

    let recovered: Vec<Value> = object_pattern()
        .map(|pattern| {
            pattern
                .find_iter(completion)
                .filter_map(|chunk| {
                    let chunk = chunk.as_str();
                    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(chunk) {
                        return Some(value);
                    }
                    let query = capture_string_field(chunk, "query")?;
                    let mut object = serde_json::Map::new();
                    object.insert("query".to_string(), Value::String(query));
                    if let Some(reasoning) = capture_string_field(chunk, "reasoning") {
                        object.insert("reasoning".to_string(), Value::String(reasoning));
                    }
                    Some(Value::Object(object))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut warnings = Vec::new();
    let candidates = collect_candidates(recovered.iter(), &mut warnings);

    if candidates.is_empty() {
        return ParseOutcome::fallback(
            Vec::new(),
            format!("unparsable query list ({}), nothing recovered", reason),
            completion,
            CONTEXT,
        );
    }

    warnings.insert(
        0,
        format!(
            "response was not valid JSON ({}); recovered {} entries",
            reason,
            candidates.len()
        ),
    );
    ParseOutcome::parsed(candidates, warnings, CONTEXT)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Pass 1
// ============================================================================

/// Pre-execution score components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass1Breakdown {
    /// 0-40
    #[serde(alias = "expected_yield")]
    pub expected_yield: f64,
    /// 0-35
    #[serde(alias = "persona_relevance")]
    pub persona_relevance: f64,
    /// 0-25
    #[serde(alias = "query_uniqueness")]
    pub query_uniqueness: f64,
}

/// Parsed Pass 1 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pass1Score {
    pub score: f64,
    pub breakdown: Pass1Breakdown,
    pub reasoning: String,
}

impl Pass1Score {
    /// Score used when the response cannot be read.
    pub fn fallback(reason: &str) -> Self {
        Self {
            score: PASS1_FALLBACK_SCORE,
            breakdown: Pass1Breakdown {
                expected_yield: 8.0,
                persona_relevance: 7.0,
                query_uniqueness: 5.0,
            },
            reasoning: format!("Pass 1 scoring failed: {}", reason),
        }
    }
}

/// Parse a Pass 1 scoring response, falling back to [`Pass1Score::fallback`].
pub fn parse_pass1(completion: &str) -> ParseOutcome<Pass1Score> {
    const CONTEXT: &str = "pass1";

    let raw = match extract_json_from_completion(completion)
        .and_then(|json| serde_json::from_str::<Pass1Score>(json).map_err(|e| e.to_string()))
    {
        Ok(raw) => raw,
        Err(reason) => {
            return ParseOutcome::fallback(
                Pass1Score::fallback(&format!("response parsing failed: {}", reason)),
                reason,
                completion,
                CONTEXT,
            );
        }
    };

    let mut warnings = Vec::new();
    let (score, diag) = clamp_score(raw.score, "score");
    warnings.extend(diag);
    check_range(&mut warnings, "expectedYield", raw.breakdown.expected_yield, 40.0);
    check_range(&mut warnings, "personaRelevance", raw.breakdown.persona_relevance, 35.0);
    check_range(&mut warnings, "queryUniqueness", raw.breakdown.query_uniqueness, 25.0);

    ParseOutcome::parsed(Pass1Score { score, ..raw }, warnings, CONTEXT)
}

fn check_range(warnings: &mut Vec<String>, label: &str, value: f64, max: f64) {
    if !(0.0..=max).contains(&value) {
        warnings.push(format!("{} {} outside documented range 0-{}", label, value, max));
    }
}

// ============================================================================
// Pass 2
// ============================================================================

/// Sampled-results score components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass2Breakdown {
    /// 0-50
    #[serde(alias = "result_relevance")]
    pub result_relevance: f64,
    /// 0-30
    #[serde(alias = "quality_signal")]
    pub quality_signal: f64,
    /// 0-20
    pub diversity: f64,
}

/// Parsed Pass 2 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass2Score {
    pub score: f64,
    pub relevant_count: u32,
    pub breakdown: Pass2Breakdown,
    pub reasoning: String,
    pub top_matches: Vec<String>,
}

impl Pass2Score {
    /// Score used when the response cannot be read.
    pub fn fallback(reason: &str) -> Self {
        Self {
            score: PASS2_FALLBACK_SCORE,
            relevant_count: 0,
            breakdown: Pass2Breakdown {
                result_relevance: 5.0,
                quality_signal: 5.0,
                diversity: 5.0,
            },
            reasoning: format!("Pass 2 scoring failed: {}", reason),
            top_matches: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPass2 {
    score: f64,
    #[serde(default, alias = "relevant_count")]
    relevant_count: f64,
    breakdown: Pass2Breakdown,
    reasoning: String,
    #[serde(default, alias = "top_matches")]
    top_matches: Vec<Value>,
}

/// Parse a Pass 2 scoring response, falling back to [`Pass2Score::fallback`].
pub fn parse_pass2(completion: &str) -> ParseOutcome<Pass2Score> {
    const CONTEXT: &str = "pass2";

    let raw = match extract_json_from_completion(completion)
        .and_then(|json| serde_json::from_str::<RawPass2>(json).map_err(|e| e.to_string()))
    {
        Ok(raw) => raw,
        Err(reason) => {
            return ParseOutcome::fallback(
                Pass2Score::fallback(&format!("response parsing failed: {}", reason)),
                reason,
                completion,
                CONTEXT,
            );
        }
    };

    let mut warnings = Vec::new();
    let (score, diag) = clamp_score(raw.score, "score");
    warnings.extend(diag);
    check_range(&mut warnings, "resultRelevance", raw.breakdown.result_relevance, 50.0);
    check_range(&mut warnings, "qualitySignal", raw.breakdown.quality_signal, 30.0);
    check_range(&mut warnings, "diversity", raw.breakdown.diversity, 20.0);

    let relevant_count = if raw.relevant_count < 0.0 {
        warnings.push(format!("relevantCount {} negative, clamped to 0", raw.relevant_count));
        0
    } else {
        raw.relevant_count.round() as u32
    };

    let top_matches = raw
        .top_matches
        .into_iter()
        .filter_map(|entry| match entry {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("url").and_then(Value::as_str).map(str::to_string),
            other => {
                warnings.push(format!("topMatches entry of type {} ignored", json_kind(&other)));
                None
            }
        })
        .collect();

    ParseOutcome::parsed(
        Pass2Score {
            score,
            relevant_count,
            breakdown: raw.breakdown,
            reasoning: raw.reasoning,
            top_matches,
        },
        warnings,
        CONTEXT,
    )
}
