use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub search: SearchConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub pipeline: PipelineDefaults,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Search backend configuration
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: String,
    pub base_url: String,
    pub country: String,
    pub language: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration shared by the Langbase and search clients
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe name configuration
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub query_generation: String,
    pub pass1: String,
    pub pass2: String,
}

/// Defaults for new pipeline sessions and orchestrator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefaults {
    pub pass1_threshold: f64,
    pub pass2_threshold: f64,
    pub query_budget_per_round: usize,
    pub concurrency_limit: usize,
    pub max_results_per_query: usize,
    /// Result count requested when sampling a query during Pass 2.
    pub sample_size: usize,
    /// How many prior top queries are fed back into generation.
    pub context_queries: usize,
    pub weight_pass1: f64,
    pub weight_pass2: f64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let search = SearchConfig {
            api_key: env::var("SEARCH_API_KEY").map_err(|_| AppError::Config {
                message: "SEARCH_API_KEY is required".to_string(),
            })?,
            base_url: env::var("SEARCH_BASE_URL")
                .unwrap_or_else(|_| "https://api.search.example.com".to_string()),
            country: env::var("SEARCH_COUNTRY").unwrap_or_else(|_| "us".to_string()),
            language: env::var("SEARCH_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/pipeline.db".to_string()),
            ),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", 30000),
            max_retries: env_or("MAX_RETRIES", 3),
            retry_delay_ms: env_or("RETRY_DELAY_MS", 1000),
        };

        let pipes = PipeConfig {
            query_generation: env::var("PIPE_QUERY_GENERATION")
                .unwrap_or_else(|_| "query-generation-v1".to_string()),
            pass1: env::var("PIPE_PASS1").unwrap_or_else(|_| "query-pass1-v1".to_string()),
            pass2: env::var("PIPE_PASS2").unwrap_or_else(|_| "query-pass2-v1".to_string()),
        };

        let defaults = PipelineDefaults::default();
        let pipeline = PipelineDefaults {
            pass1_threshold: env_or("PIPELINE_PASS1_THRESHOLD", defaults.pass1_threshold),
            pass2_threshold: env_or("PIPELINE_PASS2_THRESHOLD", defaults.pass2_threshold),
            query_budget_per_round: env_or("PIPELINE_QUERY_BUDGET", defaults.query_budget_per_round),
            concurrency_limit: env_or("PIPELINE_CONCURRENCY", defaults.concurrency_limit),
            max_results_per_query: env_or("PIPELINE_MAX_RESULTS", defaults.max_results_per_query),
            sample_size: env_or("PIPELINE_SAMPLE_SIZE", defaults.sample_size),
            context_queries: env_or("PIPELINE_CONTEXT_QUERIES", defaults.context_queries),
            weight_pass1: env_or("PIPELINE_WEIGHT_PASS1", defaults.weight_pass1),
            weight_pass2: env_or("PIPELINE_WEIGHT_PASS2", defaults.weight_pass2),
        };

        Ok(Config {
            langbase,
            search,
            database,
            logging,
            request,
            pipes,
            pipeline,
        })
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            query_generation: "query-generation-v1".to_string(),
            pass1: "query-pass1-v1".to_string(),
            pass2: "query-pass2-v1".to_string(),
        }
    }
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            pass1_threshold: 70.0,
            pass2_threshold: 60.0,
            query_budget_per_round: 10,
            concurrency_limit: 3,
            max_results_per_query: 50,
            sample_size: 5,
            context_queries: 5,
            weight_pass1: 0.3,
            weight_pass2: 0.7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let defaults = PipelineDefaults::default();
        assert_eq!(defaults.pass1_threshold, 70.0);
        assert_eq!(defaults.query_budget_per_round, 10);
        assert_eq!(defaults.sample_size, 5);
        assert!((defaults.weight_pass1 + defaults.weight_pass2 - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("MCP_QP_TEST_GARBAGE", "not-a-number");
        let value: u32 = env_or("MCP_QP_TEST_GARBAGE", 7);
        assert_eq!(value, 7);
        env::remove_var("MCP_QP_TEST_GARBAGE");
    }
}
