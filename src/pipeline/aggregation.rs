use std::collections::{BTreeSet, HashMap};

use chrono::Utc;

use super::types::AggregatedResult;
use crate::search::SearchResult;

/// Session-wide result set keyed by url.
///
/// Holds exactly one entry per distinct url no matter how many queries or
/// rounds returned it. Entries keep first-seen order.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    index: HashMap<String, usize>,
    results: Vec<AggregatedResult>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one query's results. Returns how many urls were new.
    ///
    /// A url seen before only gains `query` as a source; its other fields
    /// keep their first-seen values.
    pub fn merge(&mut self, query: &str, results: Vec<SearchResult>) -> usize {
        let mut added = 0;
        for result in results {
            let url = result.url.trim();
            if url.is_empty() {
                continue;
            }
            match self.index.get(url) {
                Some(&position) => {
                    self.results[position]
                        .source_queries
                        .insert(query.to_string());
                }
                None => {
                    self.index.insert(url.to_string(), self.results.len());
                    self.results.push(AggregatedResult {
                        result,
                        source_queries: BTreeSet::from([query.to_string()]),
                        first_seen_at: Utc::now(),
                    });
                    added += 1;
                }
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&AggregatedResult> {
        self.index.get(url).map(|&position| &self.results[position])
    }

    pub fn results(&self) -> &[AggregatedResult] {
        &self.results
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.results.clear();
    }
}
