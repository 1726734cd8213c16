//! MCP protocol implementation for JSON-RPC 2.0 communication.
//!
//! This module provides the core MCP server implementation including:
//! - JSON-RPC 2.0 request/response handling
//! - Tool definitions and schemas
//! - Stdio-based server communication

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// MCP protocol revision this server speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null if notification, always present in JSON-RPC 2.0 responses).
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP server information returned during initialization.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    /// The server name identifier.
    pub name: String,
    /// The server version string.
    pub version: String,
}

/// MCP server capabilities advertised to clients.
#[derive(Debug, Serialize)]
pub struct Capabilities {
    /// Tool-related capabilities.
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change dynamically.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the MCP initialize handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    /// The MCP protocol version supported.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: Capabilities,
    /// Server identification information.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Unique tool name (used in tool calls).
    pub name: String,
    /// Human-readable description of the tool.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    /// The content type (e.g., "text").
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text content of the result.
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// The result content items.
    pub content: Vec<ToolResultContent>,
    /// Whether the result represents an error.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolResultContent {
    /// Plain-text content item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// MCP Server running over stdio.
///
/// Handles JSON-RPC 2.0 messages over stdin/stdout for MCP protocol
/// communication with clients.
pub struct McpServer {
    /// Shared application state.
    state: SharedState,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Run the server using async stdio
    pub async fn run(&self) -> std::io::Result<()> {
        info!("MCP query pipeline server starting...");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve newline-delimited JSON-RPC from `reader` until EOF.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    Some(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            // Notifications get no response
            if let Some(response) = response {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                writer.write_all(response_json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }

        Ok(())
    }

    /// Handle a single JSON-RPC request
    /// Returns None for notifications (requests without id) as JSON-RPC 2.0 requires
    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        // Check if this is a notification (no id = no response required)
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" => {
                // Notification - no response per JSON-RPC 2.0
                debug!("Received initialized notification");
                None
            }
            "notifications/cancelled" => {
                // Notification - no response
                debug!("Received cancelled notification");
                None
            }
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "tools/call" => Some(self.handle_tool_call(request.id, request.params).await),
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                // For unknown methods, only respond if it's a request (has id)
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    Some(JsonRpcResponse::error(
                        request.id,
                        METHOD_NOT_FOUND,
                        format!("Method not found: {}", method),
                    ))
                }
            }
        }
    }

    /// Handle initialize request
    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "mcp-query-pipeline".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        }
    }

    /// Handle tools/list request
    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling tools/list request");

        let tools = all_tools();

        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "tools": tools
            }),
        )
    }

    /// Handle tools/call request
    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(p) => p,
                Err(e) => {
                    return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e));
                }
            },
            None => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params");
            }
        };

        info!(tool = %params.name, "Handling tool call");

        let (text, is_error) =
            match handle_tool_call(&self.state, &params.name, params.arguments).await {
                Ok(result) => {
                    let text = serde_json::to_string_pretty(&result).unwrap_or_else(|e| {
                        error!(error = %e, "Failed to serialize tool result");
                        format!("{{\"error\": \"Serialization failed: {}\"}}", e)
                    });
                    (text, None)
                }
                Err(e) => {
                    debug!(tool = %params.name, error = %e, "Tool call failed");
                    (format!("Error: {}", e), Some(true))
                }
            };

        let tool_result = ToolCallResult {
            content: vec![ToolResultContent::text(text)],
            is_error,
        };

        match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize tool call result");
                JsonRpcResponse::error(id.clone(), INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        }
    }
}

/// Every tool this server exposes, in `tools/list` order.
pub fn all_tools() -> Vec<Tool> {
    vec![
        // Lifecycle
        get_start_tool(),
        get_generate_more_tool(),
        get_pause_tool(),
        get_resume_tool(),
        get_stop_tool(),
        get_cancel_query_tool(),
        // Inspection
        get_status_tool(),
        get_queries_tool(),
        get_results_tool(),
        get_history_tool(),
        get_top_queries_tool(),
    ]
}

fn session_only_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "session_id": {
                "type": "string",
                "description": "Session ID returned by pipeline_start"
            }
        },
        "required": ["session_id"],
        "additionalProperties": false
    })
}

fn session_with_limit_schema(limit_description: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "session_id": {
                "type": "string",
                "description": "Session ID returned by pipeline_start"
            },
            "limit": {
                "type": "integer",
                "minimum": 1,
                "description": limit_description
            }
        },
        "required": ["session_id"],
        "additionalProperties": false
    })
}

/// Get the pipeline start tool definition
fn get_start_tool() -> Tool {
    Tool {
        name: "pipeline_start".to_string(),
        description: "Start a new query pipeline session. Generates candidate search queries for a persona, gates them through two scoring passes, executes the survivors and aggregates deduplicated results. Runs in the background; poll pipeline_status.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "persona": {
                    "type": "string",
                    "description": "Free-text description of the target profile"
                },
                "seed_query": {
                    "type": "string",
                    "description": "Initial query used to bootstrap generation"
                },
                "scoring_instructions": {
                    "type": "string",
                    "description": "Extra guidance for both scoring passes"
                },
                "pass1_threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 100,
                    "description": "Minimum Pass 1 score to proceed (default 70)"
                },
                "pass2_threshold": {
                    "type": "number",
                    "minimum": 0,
                    "maximum": 100,
                    "description": "Minimum Pass 2 score to execute (default 60)"
                },
                "query_budget_per_round": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum new queries per round (default 10)"
                },
                "concurrency_limit": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Maximum concurrent scoring or search calls (default 3)"
                },
                "max_results_per_query": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Results requested per executed query (default 50)"
                }
            },
            "required": ["persona", "seed_query"],
            "additionalProperties": false
        }),
    }
}

/// Get the generate-more tool definition
fn get_generate_more_tool() -> Tool {
    Tool {
        name: "pipeline_generate_more".to_string(),
        description: "Run another round on an existing session. Previous top queries guide generation; results accumulate across rounds.".to_string(),
        input_schema: session_only_schema(),
    }
}

fn get_pause_tool() -> Tool {
    Tool {
        name: "pipeline_pause".to_string(),
        description: "Pause a running session at the next stage boundary. In-flight calls finish.".to_string(),
        input_schema: session_only_schema(),
    }
}

fn get_resume_tool() -> Tool {
    Tool {
        name: "pipeline_resume".to_string(),
        description: "Resume a paused session.".to_string(),
        input_schema: session_only_schema(),
    }
}

fn get_stop_tool() -> Tool {
    Tool {
        name: "pipeline_stop".to_string(),
        description: "Stop a session and cancel every in-flight call. Results of cancelled calls are discarded.".to_string(),
        input_schema: session_only_schema(),
    }
}

/// Get the cancel-query tool definition
fn get_cancel_query_tool() -> Tool {
    Tool {
        name: "pipeline_cancel_query".to_string(),
        description: "Cancel in-flight scoring or execution for a single query. The query keeps its last finalized status.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Session ID returned by pipeline_start"
                },
                "query": {
                    "type": "string",
                    "description": "Query text (matched case-insensitively)"
                }
            },
            "required": ["session_id", "query"],
            "additionalProperties": false
        }),
    }
}

fn get_status_tool() -> Tool {
    Tool {
        name: "pipeline_status".to_string(),
        description: "Get stage, round, running/paused flags, stats and progress for a session.".to_string(),
        input_schema: session_only_schema(),
    }
}

fn get_queries_tool() -> Tool {
    Tool {
        name: "pipeline_queries".to_string(),
        description: "List every generated query of a session with its scores and statuses.".to_string(),
        input_schema: session_only_schema(),
    }
}

fn get_results_tool() -> Tool {
    Tool {
        name: "pipeline_results".to_string(),
        description: "List the deduplicated search results of a session in first-seen order.".to_string(),
        input_schema: session_with_limit_schema("Maximum number of results to return"),
    }
}

fn get_history_tool() -> Tool {
    Tool {
        name: "pipeline_history".to_string(),
        description: "Per-round summary of a session: generated, passed Pass 1, passed Pass 2, average composite score.".to_string(),
        input_schema: session_only_schema(),
    }
}

fn get_top_queries_tool() -> Tool {
    Tool {
        name: "pipeline_top_queries".to_string(),
        description: "Highest composite-scoring queries of a session.".to_string(),
        input_schema: session_with_limit_schema("Maximum number of queries to return (default 10)"),
    }
}
