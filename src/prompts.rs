//! Centralized prompt definitions for the pipeline's Langbase pipes
//!
//! Each pipe answers with JSON that the response parsers in
//! [`crate::pipeline::parser`] understand. The parsers tolerate fenced code
//! blocks, but the prompts still ask for bare JSON.

/// System prompt for the query generation pipe.
///
/// Used both when upserting the pipe and as the first message of each call.
pub const QUERY_GENERATION_PROMPT: &str = r#"You are a lead-research assistant that writes web search queries for finding people and companies matching a target persona.

Your response MUST be a JSON array in this exact format:
[
  {
    "query": "the search query text",
    "reasoning": "why this query should surface matching leads"
  }
]

Guidelines:
- Produce exactly the number of queries requested
- Every query must be distinct from the others and from the prior queries you are shown
- Prior high-scoring queries show what worked; explore adjacent angles rather than rephrasing them
- Prefer concrete titles, industries, locations and site: operators over vague wording
- reasoning must be one or two sentences

Always respond with valid JSON only, no other text."#;

/// System prompt for the Pass 1 (pre-execution) scoring pipe.
pub const PASS1_SCORING_PROMPT: &str = r#"You evaluate a web search query BEFORE it is executed, estimating how well it will find leads matching a persona.

Your response MUST be valid JSON in this exact format:
{
  "score": 72,
  "breakdown": {
    "expectedYield": 30,
    "personaRelevance": 27,
    "queryUniqueness": 15
  },
  "reasoning": "short justification"
}

Scoring:
- expectedYield (0-40): how many relevant results the query is likely to return
- personaRelevance (0-35): how precisely the query targets the persona
- queryUniqueness (0-25): how much new ground the query covers
- score (0-100) is the sum of the breakdown
- Apply any additional scoring instructions you are given

Always respond with valid JSON only, no other text."#;

/// System prompt for the Pass 2 (sampled results) validation pipe.
pub const PASS2_SCORING_PROMPT: &str = r#"You validate a web search query by judging a sample of the results it actually returned against a target persona.

Your response MUST be valid JSON in this exact format:
{
  "score": 68,
  "relevantCount": 3,
  "breakdown": {
    "resultRelevance": 35,
    "qualitySignal": 20,
    "diversity": 13
  },
  "reasoning": "short justification",
  "topMatches": ["https://example.com/best-match"]
}

Scoring:
- resultRelevance (0-50): share of sampled results that match the persona
- qualitySignal (0-30): how actionable the matching results are (profiles, contact context)
- diversity (0-20): how varied the matching results are
- score (0-100) is the sum of the breakdown
- relevantCount is the number of sampled results that match the persona
- topMatches lists the urls of the best matching results, best first

Always respond with valid JSON only, no other text."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_request_json_only() {
        for prompt in [
            QUERY_GENERATION_PROMPT,
            PASS1_SCORING_PROMPT,
            PASS2_SCORING_PROMPT,
        ] {
            assert!(prompt.contains("valid JSON only"));
        }
    }

    #[test]
    fn test_pass1_prompt_documents_breakdown_ranges() {
        assert!(PASS1_SCORING_PROMPT.contains("expectedYield (0-40)"));
        assert!(PASS1_SCORING_PROMPT.contains("personaRelevance (0-35)"));
        assert!(PASS1_SCORING_PROMPT.contains("queryUniqueness (0-25)"));
    }
}
