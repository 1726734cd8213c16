//! Unit tests for MCP protocol implementation.
//!
//! Tests JSON-RPC 2.0 request/response handling, tool definitions,
//! and the stdio serve loop.

use super::*;
use crate::config::{
    Config, DatabaseConfig, LangbaseConfig, LogFormat, LoggingConfig, PipeConfig,
    PipelineDefaults, RequestConfig, SearchConfig,
};
use crate::error::{LangbaseError, LangbaseResult, SearchApiResult};
use crate::langbase::{GenerateQueriesRequest, Pass1Request, Pass2Request, TextGenerator};
use crate::search::{SearchBackend, SearchRequest, SearchResponse};
use crate::server::AppState;
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Generator that is never reachable; protocol tests never run a round.
struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    async fn generate_queries(&self, _: &GenerateQueriesRequest) -> LangbaseResult<String> {
        Err(offline())
    }

    async fn score_pass1(&self, _: &Pass1Request) -> LangbaseResult<String> {
        Err(offline())
    }

    async fn score_pass2(&self, _: &Pass2Request) -> LangbaseResult<String> {
        Err(offline())
    }
}

fn offline() -> LangbaseError {
    LangbaseError::Unavailable {
        message: "offline".to_string(),
        retries: 0,
    }
}

struct EmptySearch;

#[async_trait]
impl SearchBackend for EmptySearch {
    async fn search(&self, _: SearchRequest) -> SearchApiResult<SearchResponse> {
        Ok(SearchResponse::default())
    }
}

fn create_server() -> McpServer {
    let config = Config {
        langbase: LangbaseConfig {
            api_key: "test-key".to_string(),
            base_url: "https://api.langbase.com".to_string(),
        },
        search: SearchConfig {
            api_key: "search-key".to_string(),
            base_url: "https://api.search.example.com".to_string(),
            country: "us".to_string(),
            language: "en".to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        },
        request: RequestConfig::default(),
        pipes: PipeConfig::default(),
        pipeline: PipelineDefaults::default(),
    };
    let state = AppState::new(config, Arc::new(OfflineGenerator), Arc::new(EmptySearch));
    McpServer::new(Arc::new(state))
}

fn request(id: Option<Value>, method: &str, params: Option<Value>) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id,
        method: method.to_string(),
        params,
    }
}

// ============================================================================
// JsonRpcResponse tests
// ============================================================================

#[test]
fn test_jsonrpc_response_success_with_id() {
    let response = JsonRpcResponse::success(Some(json!(1)), json!({"result": "ok"}));

    assert_eq!(response.jsonrpc, "2.0");
    assert_eq!(response.id, json!(1));
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["result"], "ok");
}

#[test]
fn test_jsonrpc_response_success_without_id() {
    let response = JsonRpcResponse::success(None, json!({"data": "value"}));

    assert_eq!(response.id, Value::Null);
    assert!(response.result.is_some());
}

#[test]
fn test_jsonrpc_response_error_with_id() {
    let response = JsonRpcResponse::error(Some(json!(42)), -32600, "Invalid request");

    assert_eq!(response.id, json!(42));
    assert!(response.result.is_none());

    let error = response.error.unwrap();
    assert_eq!(error.code, -32600);
    assert_eq!(error.message, "Invalid request");
}

#[test]
fn test_jsonrpc_response_serialization_omits_empty_side() {
    let serialized =
        serde_json::to_string(&JsonRpcResponse::success(Some(json!(1)), json!({"test": true})))
            .unwrap();
    assert!(serialized.contains("\"jsonrpc\":\"2.0\""));
    assert!(serialized.contains("\"result\""));
    assert!(!serialized.contains("\"error\""));

    let serialized =
        serde_json::to_string(&JsonRpcResponse::error(Some(json!(1)), -32601, "nope")).unwrap();
    assert!(serialized.contains("-32601"));
    assert!(!serialized.contains("\"result\""));
}

// ============================================================================
// Request parsing tests
// ============================================================================

#[test]
fn test_jsonrpc_request_deserialization() {
    let parsed: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": "req-1",
        "method": "tools/call",
        "params": {"name": "pipeline_status", "arguments": {"session_id": "s"}}
    }))
    .unwrap();

    assert_eq!(parsed.id, Some(json!("req-1")));
    assert_eq!(parsed.method, "tools/call");

    let params: ToolCallParams = serde_json::from_value(parsed.params.unwrap()).unwrap();
    assert_eq!(params.name, "pipeline_status");
    assert_eq!(params.arguments.unwrap()["session_id"], "s");
}

#[test]
fn test_jsonrpc_notification_no_id() {
    let parsed: JsonRpcRequest =
        serde_json::from_str(r#"{"jsonrpc": "2.0", "method": "initialized"}"#).unwrap();
    assert!(parsed.id.is_none());
    assert!(parsed.params.is_none());
}

// ============================================================================
// Tool definition tests
// ============================================================================

#[test]
fn test_all_tools_listed() {
    let names: Vec<String> = all_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(
        names,
        vec![
            "pipeline_start",
            "pipeline_generate_more",
            "pipeline_pause",
            "pipeline_resume",
            "pipeline_stop",
            "pipeline_cancel_query",
            "pipeline_status",
            "pipeline_queries",
            "pipeline_results",
            "pipeline_history",
            "pipeline_top_queries",
        ]
    );
}

#[test]
fn test_all_tools_have_valid_schemas() {
    for tool in all_tools() {
        let schema = &tool.input_schema;
        assert_eq!(schema["type"], "object", "{} schema type", tool.name);
        assert_eq!(schema["additionalProperties"], false, "{}", tool.name);
        assert!(schema["required"].is_array(), "{} required", tool.name);
        assert!(!tool.description.is_empty());
    }
}

#[test]
fn test_start_tool_threshold_bounds() {
    let tool = all_tools()
        .into_iter()
        .find(|t| t.name == "pipeline_start")
        .unwrap();
    let props = &tool.input_schema["properties"];
    assert_eq!(props["pass1_threshold"]["minimum"], 0);
    assert_eq!(props["pass1_threshold"]["maximum"], 100);
    assert_eq!(tool.input_schema["required"], json!(["persona", "seed_query"]));
}

#[test]
fn test_tool_serialization_field_names() {
    let serialized = serde_json::to_value(&all_tools()[0]).unwrap();
    assert!(serialized.get("inputSchema").is_some());
    assert!(serialized.get("input_schema").is_none());
}

#[test]
fn test_tool_call_result_serialization() {
    let result = ToolCallResult {
        content: vec![ToolResultContent::text("boom")],
        is_error: Some(true),
    };
    let serialized = serde_json::to_value(&result).unwrap();
    assert_eq!(serialized["content"][0]["type"], "text");
    assert_eq!(serialized["isError"], true);

    let ok = ToolCallResult {
        content: vec![ToolResultContent::text("{}")],
        is_error: None,
    };
    assert!(serde_json::to_value(&ok).unwrap().get("isError").is_none());
}

// ============================================================================
// Request handling tests
// ============================================================================

#[tokio::test]
async fn test_initialize_reports_server_info() {
    let server = create_server();
    let response = server
        .handle_request(request(Some(json!(1)), "initialize", None))
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(result["serverInfo"]["name"], "mcp-query-pipeline");
    assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let server = create_server();
    assert!(server
        .handle_request(request(None, "initialized", None))
        .await
        .is_none());
    assert!(server
        .handle_request(request(None, "something/unknown", None))
        .await
        .is_none());
}

#[tokio::test]
async fn test_unknown_method_is_an_error() {
    let server = create_server();
    let response = server
        .handle_request(request(Some(json!(7)), "resources/list", None))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_tools_call_without_params() {
    let server = create_server();
    let response = server
        .handle_request(request(Some(json!(2)), "tools/call", None))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
}

#[tokio::test]
async fn test_tool_failure_is_reported_in_result() {
    let server = create_server();
    let response = server
        .handle_request(request(
            Some(json!(3)),
            "tools/call",
            Some(json!({"name": "pipeline_status", "arguments": {"session_id": "missing"}})),
        ))
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["isError"], true);
    assert!(result["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("not found"));
}

#[tokio::test]
async fn test_serve_answers_each_line() {
    let server = create_server();
    let input = concat!(
        r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        "\n",
        "\n",
        r#"{"jsonrpc":"2.0","method":"initialized"}"#,
        "\n",
        "not json\n",
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        "\n",
    );
    let mut output = Vec::new();

    server
        .serve(tokio::io::BufReader::new(input.as_bytes()), &mut output)
        .await
        .unwrap();

    let lines: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["id"], 1);
    assert_eq!(lines[1]["error"]["code"], PARSE_ERROR);
    assert_eq!(lines[2]["result"]["tools"].as_array().unwrap().len(), 11);
}
