use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::client::LangbaseClient;
use super::types::{Message, PipeRequest};
use crate::config::PipeConfig;
use crate::error::LangbaseResult;
use crate::pipeline::TopQueryContext;
use crate::prompts::{PASS1_SCORING_PROMPT, PASS2_SCORING_PROMPT, QUERY_GENERATION_PROMPT};
use crate::search::SearchResult;

/// Request for a batch of candidate queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateQueriesRequest {
    pub persona: String,
    pub seed_query: String,
    pub round: u32,
    /// Number of candidates wanted.
    pub count: usize,
    pub top_queries_context: Vec<TopQueryContext>,
}

/// Request for a Pass 1 (pre-execution) score.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass1Request {
    pub query: String,
    pub persona: String,
    pub scoring_instructions: String,
}

/// Request for a Pass 2 (sampled results) score.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pass2Request {
    pub query: String,
    pub sampled_results: Vec<SearchResult>,
    pub persona: String,
    pub scoring_instructions: String,
}

/// Text-generation backend used by the pipeline.
///
/// Every method returns the raw completion text; interpretation belongs to
/// [`crate::pipeline::parser`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_queries(&self, request: &GenerateQueriesRequest) -> LangbaseResult<String>;

    async fn score_pass1(&self, request: &Pass1Request) -> LangbaseResult<String>;

    async fn score_pass2(&self, request: &Pass2Request) -> LangbaseResult<String>;
}

/// [`TextGenerator`] backed by three Langbase pipes.
#[derive(Clone)]
pub struct LangbaseGenerator {
    client: LangbaseClient,
    pipes: PipeConfig,
}

impl LangbaseGenerator {
    pub fn new(client: LangbaseClient, pipes: PipeConfig) -> Self {
        Self { client, pipes }
    }

    async fn run(&self, pipe: &str, system_prompt: &str, user: String) -> LangbaseResult<String> {
        let messages = vec![Message::system(system_prompt), Message::user(user)];
        let response = self.client.call_pipe(PipeRequest::new(pipe, messages)).await?;
        debug!(pipe = %pipe, length = response.completion.len(), "Pipe completion received");
        Ok(response.completion)
    }
}

#[async_trait]
impl TextGenerator for LangbaseGenerator {
    async fn generate_queries(&self, request: &GenerateQueriesRequest) -> LangbaseResult<String> {
        self.run(
            &self.pipes.query_generation,
            QUERY_GENERATION_PROMPT,
            build_generation_message(request),
        )
        .await
    }

    async fn score_pass1(&self, request: &Pass1Request) -> LangbaseResult<String> {
        self.run(
            &self.pipes.pass1,
            PASS1_SCORING_PROMPT,
            build_pass1_message(request),
        )
        .await
    }

    async fn score_pass2(&self, request: &Pass2Request) -> LangbaseResult<String> {
        self.run(
            &self.pipes.pass2,
            PASS2_SCORING_PROMPT,
            build_pass2_message(request),
        )
        .await
    }
}

fn build_generation_message(request: &GenerateQueriesRequest) -> String {
    let mut message = format!(
        "Persona: {}\nSeed query: {}\nRound: {}\nGenerate {} search queries.",
        request.persona, request.seed_query, request.round, request.count
    );

    if !request.top_queries_context.is_empty() {
        let context: Vec<String> = request
            .top_queries_context
            .iter()
            .map(|q| {
                format!(
                    "- \"{}\" (composite {:.1}, pass1 {:.0}, pass2 {:.0})",
                    q.query, q.composite_score, q.pass1_score, q.pass2_score
                )
            })
            .collect();
        message.push_str("\n\nBest queries so far:\n");
        message.push_str(&context.join("\n"));
    }

    message
}

fn build_pass1_message(request: &Pass1Request) -> String {
    let mut message = format!("Persona: {}\nQuery: {}", request.persona, request.query);
    push_instructions(&mut message, &request.scoring_instructions);
    message
}

fn build_pass2_message(request: &Pass2Request) -> String {
    let sampled: Vec<String> = request
        .sampled_results
        .iter()
        .map(|r| {
            let mut line = format!("{}. [{}] {} <{}>", r.rank, r.result_type, r.title, r.url);
            if !r.description.is_empty() {
                line.push_str(&format!("\n   {}", r.description));
            }
            line
        })
        .collect();

    let mut message = format!(
        "Persona: {}\nQuery: {}\n\nSampled results ({}):\n{}",
        request.persona,
        request.query,
        request.sampled_results.len(),
        if sampled.is_empty() {
            "(none)".to_string()
        } else {
            sampled.join("\n")
        }
    );
    push_instructions(&mut message, &request.scoring_instructions);
    message
}

fn push_instructions(message: &mut String, instructions: &str) {
    if !instructions.trim().is_empty() {
        message.push_str("\n\nAdditional scoring instructions:\n");
        message.push_str(instructions.trim());
    }
}
