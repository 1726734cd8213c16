use serde::{Deserialize, Serialize};

/// Request to the search execution backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    pub country: String,
    pub language: String,
    pub max_results: usize,
}

/// Kind of entity a search hit points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Profile,
    Company,
    Post,
    Job,
    #[default]
    #[serde(other)]
    Other,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Profile => "profile",
            ResultType::Company => "company",
            ResultType::Post => "post",
            ResultType::Job => "job",
            ResultType::Other => "other",
        }
    }
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single ranked search hit. `url` is its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub result_type: ResultType,
    #[serde(default)]
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl SearchResult {
    /// Create a result with the required fields; optional fields stay empty.
    pub fn new(url: impl Into<String>, title: impl Into<String>, rank: u32) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            description: String::new(),
            result_type: ResultType::Other,
            rank,
            author: None,
            company: None,
            followers: None,
            location: None,
        }
    }

    pub fn with_type(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Backend-reported metadata for a search call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_results: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Response from the search execution backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<SearchResult>,
    #[serde(default)]
    pub metadata: SearchMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_request_uses_camel_case() {
        let req = SearchRequest {
            query: "cto fintech".to_string(),
            country: "us".to_string(),
            language: "en".to_string(),
            max_results: 5,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["maxResults"], 5);
        assert!(json.get("max_results").is_none());
    }

    #[test]
    fn test_unknown_result_type_maps_to_other() {
        let result: SearchResult = serde_json::from_str(
            r#"{"url": "https://a.example", "title": "A", "type": "video", "rank": 1}"#,
        )
        .unwrap();
        assert_eq!(result.result_type, ResultType::Other);
    }

    #[test]
    fn test_search_response_tolerates_missing_metadata() {
        let resp: SearchResponse = serde_json::from_str(
            r#"{"results": [{"url": "https://x.example", "type": "profile", "followers": 120}]}"#,
        )
        .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].result_type, ResultType::Profile);
        assert_eq!(resp.results[0].followers, Some(120));
        assert_eq!(resp.metadata, SearchMetadata::default());
    }
}
