use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::Result;

/// MCP protocol revision answered to `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_REQUEST: i32 = -32600;

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

/// What a tool handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    /// Plain text, wrapped as a single MCP text content entry.
    Text(String),
    /// Structured data; serialized as text content and echoed under
    /// `structuredContent`.
    Json(Value),
    /// A tool-level failure, reported with `isError: true`. Distinct from a
    /// handler error: the tool ran and is telling the model it failed.
    Error(String),
}

/// The body of an in-process tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<ToolOutput>;
}

/// Adapter for plain (non-async) tool functions.
pub struct ToolFn<F>(pub F);

#[async_trait]
impl<F> ToolHandler for ToolFn<F>
where
    F: Fn(Value) -> Result<ToolOutput> + Send + Sync,
{
    async fn call(&self, args: Value) -> Result<ToolOutput> {
        (self.0)(args)
    }
}

/// One tool exposed to the CLI: name, description, a JSON-Schema object
/// describing the input, and the handler invoked on `tools/call`.
#[derive(Clone)]
pub struct SdkTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl SdkTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        SdkTool {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }
}

/// A named set of in-process tools, declared in the options as an
/// `mcp_servers` entry. The CLI addresses it by name through `mcp_message`
/// control requests instead of spawning a subprocess for it.
#[derive(Clone, Default)]
pub struct ToolSet {
    pub name: String,
    pub tools: Vec<SdkTool>,
}

impl ToolSet {
    pub fn new(name: impl Into<String>) -> Self {
        ToolSet {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    pub fn tool(mut self, tool: SdkTool) -> Self {
        self.tools.push(tool);
        self
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Dispatches JSON-RPC messages addressed to in-process tool sets.
///
/// Notifications (no `id`) produce no response. Handler failures and panics
/// are rendered as `isError` content so a broken tool never takes the
/// adapter down.
#[derive(Default)]
pub struct McpRouter {
    servers: HashMap<String, ToolSet>,
}

impl McpRouter {
    pub fn new(servers: impl IntoIterator<Item = ToolSet>) -> Self {
        McpRouter {
            servers: servers
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Handle one JSON-RPC message addressed to `server_name`. Returns
    /// `None` for notifications.
    pub async fn handle(&self, server_name: &str, message: Value) -> Option<JsonRpcResponse> {
        let has_id = message
            .as_object()
            .map(|o| o.contains_key("id"))
            .unwrap_or(false);

        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(r) => r,
            Err(e) => {
                if !has_id {
                    return None;
                }
                return Some(error_response(
                    None,
                    INVALID_REQUEST,
                    format!("invalid request: {e}"),
                ));
            }
        };

        if request.id.is_none() {
            // Notifications (`notifications/initialized` and friends) are
            // acknowledged by silence.
            return None;
        }

        let Some(server) = self.servers.get(server_name) else {
            return Some(error_response(
                request.id,
                METHOD_NOT_FOUND,
                format!("unknown sdk server: {server_name}"),
            ));
        };

        let response = match request.method.as_str() {
            "initialize" => ok_response(
                request.id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": server.name,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "tools/list" => {
                let tools: Vec<Value> = server
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": t.input_schema,
                        })
                    })
                    .collect();
                ok_response(request.id, json!({"tools": tools}))
            }
            "tools/call" => self.call_tool(server, request.id, request.params).await,
            other => error_response(
                request.id,
                METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        };

        Some(response)
    }

    async fn call_tool(
        &self,
        server: &ToolSet,
        id: Option<Value>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let params = params.unwrap_or_else(|| json!({}));
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_response(id, INVALID_REQUEST, "tools/call without a name".into());
        };
        let Some(tool) = server.tools.iter().find(|t| t.name == name) else {
            return error_response(id, METHOD_NOT_FOUND, format!("tool not found: {name}"));
        };

        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let handler = Arc::clone(&tool.handler);
        let outcome = match tokio::spawn(async move { handler.call(args).await }).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ToolOutput::Error(e.to_string()),
            Err(_join) => ToolOutput::Error(format!("tool {name} panicked")),
        };

        ok_response(id, render_output(outcome))
    }
}

fn render_output(output: ToolOutput) -> Value {
    match output {
        ToolOutput::Text(text) => json!({
            "content": [{"type": "text", "text": text}],
        }),
        ToolOutput::Json(value) => json!({
            "content": [{"type": "text", "text": value.to_string()}],
            "structuredContent": value,
        }),
        ToolOutput::Error(message) => json!({
            "content": [{"type": "text", "text": message}],
            "isError": true,
        }),
    }
}

fn ok_response(id: Option<Value>, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }
}

fn error_response(id: Option<Value>, code: i32, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(JsonRpcError { code, message }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverError;

    fn adder() -> ToolSet {
        ToolSet::new("calc").tool(SdkTool::new(
            "add",
            "Add two integers",
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "integer"},
                },
                "required": ["a", "b"],
            }),
            Arc::new(ToolFn(|args: Value| {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(ToolOutput::Json(json!({"sum": a + b})))
            })),
        ))
    }

    fn router() -> McpRouter {
        McpRouter::new([adder()])
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_server_name() {
        let resp = router()
            .handle("calc", json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "calc");
        assert_eq!(result["capabilities"], json!({"tools": {}}));
    }

    #[tokio::test]
    async fn initialized_notification_gets_no_response() {
        let resp = router()
            .handle(
                "calc",
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            )
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn tools_list_exposes_schema() {
        let resp = router()
            .handle("calc", json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].clone();
        assert_eq!(tools[0]["name"], "add");
        assert_eq!(tools[0]["description"], "Add two integers");
        assert_eq!(tools[0]["inputSchema"]["required"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn tools_call_returns_structured_content() {
        let resp = router()
            .handle(
                "calc",
                json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "tools/call",
                    "params": {"name": "add", "arguments": {"a": 2, "b": 2}},
                }),
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["structuredContent"], json!({"sum": 4}));
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn text_output_is_wrapped_as_text_content() {
        let set = ToolSet::new("echo").tool(SdkTool::new(
            "say",
            "Echo",
            json!({"type": "object"}),
            Arc::new(ToolFn(|args: Value| {
                Ok(ToolOutput::Text(args["text"].as_str().unwrap_or("").into()))
            })),
        ));
        let resp = McpRouter::new([set])
            .handle(
                "echo",
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "tools/call",
                    "params": {"name": "say", "arguments": {"text": "hi"}},
                }),
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["content"], json!([{"type": "text", "text": "hi"}]));
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn handler_error_becomes_is_error_content() {
        let set = ToolSet::new("flaky").tool(SdkTool::new(
            "boom",
            "Always fails",
            json!({"type": "object"}),
            Arc::new(ToolFn(|_args: Value| {
                Err::<ToolOutput, _>(DriverError::Callback("disk full".into()))
            })),
        ));
        let resp = McpRouter::new([set])
            .handle(
                "flaky",
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "boom"}}),
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], json!(true));
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("disk full"));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_is_error_content() {
        struct Panics;
        #[async_trait]
        impl ToolHandler for Panics {
            async fn call(&self, _args: Value) -> Result<ToolOutput> {
                panic!("bad arithmetic");
            }
        }
        let set = ToolSet::new("p").tool(SdkTool::new(
            "explode",
            "",
            json!({"type": "object"}),
            Arc::new(Panics),
        ));
        let resp = McpRouter::new([set])
            .handle(
                "p",
                json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "explode"}}),
            )
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["isError"], json!(true));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let resp = router()
            .handle("calc", json!({"jsonrpc": "2.0", "id": 4, "method": "resources/list"}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let resp = router()
            .handle(
                "calc",
                json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call", "params": {"name": "sub"}}),
            )
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_server_is_method_not_found() {
        let resp = router()
            .handle("weather", json!({"jsonrpc": "2.0", "id": 6, "method": "tools/list"}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }
}
