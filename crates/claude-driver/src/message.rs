use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{DriverError, Result};

// ─── Outer Message enum ───────────────────────────────────────────────────

/// Every message the CLI emits on stdout in stream-json mode, after the
/// control-protocol traffic has been peeled off.
///
/// Assistant and user messages nest their payload under a `message` object
/// on the wire; [`parse_message`] elevates those fields so callers never
/// see the envelope nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System(SystemMessage),
    Assistant(AssistantMessage),
    User(UserMessage),
    Result(ResultMessage),
    /// Partial assistant deltas, present with `include_partial_messages`.
    StreamEvent(StreamEventMessage),
}

/// Discriminant-only view of [`Message`], for stream filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    System,
    Assistant,
    User,
    Result,
    StreamEvent,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::System(_) => MessageKind::System,
            Message::Assistant(_) => MessageKind::Assistant,
            Message::User(_) => MessageKind::User,
            Message::Result(_) => MessageKind::Result,
            Message::StreamEvent(_) => MessageKind::StreamEvent,
        }
    }

    /// The conversation id, when this message carries one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Message::System(m) => m.session_id.as_deref(),
            Message::Assistant(m) => m.session_id.as_deref(),
            Message::User(m) => m.session_id.as_deref(),
            Message::Result(m) => Some(m.session_id()),
            Message::StreamEvent(m) => m.session_id.as_deref(),
        }
    }

    /// `Some` if this is the terminal result message.
    pub fn as_result(&self) -> Option<&ResultMessage> {
        if let Message::Result(r) = self {
            Some(r)
        } else {
            None
        }
    }
}

// ─── System messages ──────────────────────────────────────────────────────

/// `type = "system"` — keyed by `subtype`. Only `init` has a typed shape;
/// everything else keeps its raw payload so new CLI subtypes survive a
/// round trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemMessage {
    pub session_id: Option<String>,
    pub payload: SystemPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemPayload {
    Init(SystemInit),
    Other { subtype: String, payload: Value },
}

/// The first message of every conversation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SystemInit {
    pub model: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerStatus>,
    #[serde(default, alias = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub claude_code_version: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default, alias = "apiKeySource")]
    pub api_key_source: Option<String>,
    #[serde(default)]
    pub slash_commands: Vec<String>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
}

// ─── Assistant / user messages ────────────────────────────────────────────

/// `type = "assistant"` — model output with its content blocks elevated out
/// of the wire envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub id: Option<String>,
    pub model: Option<String>,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Option<TokenUsage>,
    pub parent_tool_use_id: Option<String>,
    pub session_id: Option<String>,
}

impl AssistantMessage {
    /// Concatenated text of all Text blocks.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// `type = "user"` — synthetic turns the CLI injects, typically tool
/// results reported back into the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    pub parent_tool_use_id: Option<String>,
    pub session_id: Option<String>,
}

/// Content blocks inside assistant and user messages.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Tool inputs are schema-polymorphic, so Value is correct here.
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

/// Tool-result content arrives either as a bare string or as a list of
/// typed content entries, depending on the tool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl ToolResultContent {
    /// Flatten to plain text, joining text entries of a block list.
    pub fn as_text(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

// ─── Result messages ──────────────────────────────────────────────────────

/// `type = "result"` — the terminal message of every query.
///
/// The two older subtype tokens the CLI used before the current naming are
/// accepted as aliases of the error shape they correspond to.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ResultMessage {
    Success(ResultSuccess),
    #[serde(alias = "max_turns")]
    ErrorMaxTurns(ResultError),
    #[serde(alias = "error")]
    ErrorDuringExecution(ResultError),
    ErrorMaxBudgetUsd(ResultError),
    ErrorMaxStructuredOutputRetries(ResultError),
}

impl ResultMessage {
    pub fn session_id(&self) -> &str {
        match self {
            ResultMessage::Success(r) => &r.session_id,
            ResultMessage::ErrorMaxTurns(r)
            | ResultMessage::ErrorDuringExecution(r)
            | ResultMessage::ErrorMaxBudgetUsd(r)
            | ResultMessage::ErrorMaxStructuredOutputRetries(r) => &r.session_id,
        }
    }

    /// Whether the query ended on any error subtype. Note this is distinct
    /// from a transport failure: an `error_max_turns` result is still a
    /// normally delivered terminal message.
    pub fn is_error(&self) -> bool {
        !matches!(self, ResultMessage::Success(_))
    }

    pub fn subtype(&self) -> &'static str {
        match self {
            ResultMessage::Success(_) => "success",
            ResultMessage::ErrorMaxTurns(_) => "error_max_turns",
            ResultMessage::ErrorDuringExecution(_) => "error_during_execution",
            ResultMessage::ErrorMaxBudgetUsd(_) => "error_max_budget_usd",
            ResultMessage::ErrorMaxStructuredOutputRetries(_) => {
                "error_max_structured_output_retries"
            }
        }
    }

    /// The final result text; `None` for error subtypes.
    pub fn result_text(&self) -> Option<&str> {
        if let ResultMessage::Success(r) = self {
            Some(&r.result)
        } else {
            None
        }
    }

    pub fn total_cost_usd(&self) -> f64 {
        match self {
            ResultMessage::Success(r) => r.total_cost_usd,
            ResultMessage::ErrorMaxTurns(r)
            | ResultMessage::ErrorDuringExecution(r)
            | ResultMessage::ErrorMaxBudgetUsd(r)
            | ResultMessage::ErrorMaxStructuredOutputRetries(r) => r.total_cost_usd,
        }
    }

    pub fn num_turns(&self) -> u32 {
        match self {
            ResultMessage::Success(r) => r.num_turns,
            ResultMessage::ErrorMaxTurns(r)
            | ResultMessage::ErrorDuringExecution(r)
            | ResultMessage::ErrorMaxBudgetUsd(r)
            | ResultMessage::ErrorMaxStructuredOutputRetries(r) => r.num_turns,
        }
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        match self {
            ResultMessage::Success(r) => r.usage.as_ref(),
            ResultMessage::ErrorMaxTurns(r)
            | ResultMessage::ErrorDuringExecution(r)
            | ResultMessage::ErrorMaxBudgetUsd(r)
            | ResultMessage::ErrorMaxStructuredOutputRetries(r) => r.usage.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResultSuccess {
    pub session_id: String,
    pub result: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResultError {
    pub session_id: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default = "default_true")]
    pub is_error: bool,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

fn default_true() -> bool {
    true
}

// ─── Partial assistant events ─────────────────────────────────────────────

/// `type = "stream_event"` — a raw Anthropic streaming event, forwarded
/// when partial messages are requested.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventMessage {
    pub event: Value,
    pub parent_tool_use_id: Option<String>,
    pub session_id: Option<String>,
}

impl StreamEventMessage {
    /// The text delta, when this event is a `content_block_delta` carrying
    /// one.
    pub fn text_delta(&self) -> Option<&str> {
        if self.event.get("type")?.as_str()? != "content_block_delta" {
            return None;
        }
        let delta = self.event.get("delta")?;
        if delta.get("type")?.as_str()? != "text_delta" {
            return None;
        }
        delta.get("text")?.as_str()
    }
}

// ─── Wire envelopes ───────────────────────────────────────────────────────

#[derive(Deserialize, Serialize)]
struct WireTurn {
    message: WireTurnBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct WireTurnBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct WireStreamEvent {
    #[serde(default)]
    event: Value,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

// ─── Parsing ──────────────────────────────────────────────────────────────

/// Map one decoded NDJSON object to its typed message.
///
/// A failure here is never fatal to a query: the adapter layer logs it at
/// debug level and drops the line.
pub fn parse_message(value: &Value) -> Result<Message> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::Parse("missing top-level type field".into()))?;

    match kind {
        "system" => parse_system(value),
        "assistant" => {
            let wire: WireTurn = from_value(value)?;
            Ok(Message::Assistant(AssistantMessage {
                id: wire.message.id,
                model: wire.message.model,
                content: wire.message.content,
                stop_reason: wire.message.stop_reason,
                stop_sequence: wire.message.stop_sequence,
                usage: wire.message.usage,
                parent_tool_use_id: wire.parent_tool_use_id,
                session_id: wire.session_id,
            }))
        }
        "user" => {
            let wire: WireTurn = from_value(value)?;
            Ok(Message::User(UserMessage {
                content: wire.message.content,
                parent_tool_use_id: wire.parent_tool_use_id,
                session_id: wire.session_id,
            }))
        }
        "result" => Ok(Message::Result(from_value(value)?)),
        "stream_event" => {
            let wire: WireStreamEvent = from_value(value)?;
            Ok(Message::StreamEvent(StreamEventMessage {
                event: wire.event,
                parent_tool_use_id: wire.parent_tool_use_id,
                session_id: wire.session_id,
            }))
        }
        other => Err(DriverError::Parse(format!("unknown message type: {other}"))),
    }
}

fn parse_system(value: &Value) -> Result<Message> {
    let subtype = value
        .get("subtype")
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::Parse("system message without subtype".into()))?;
    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let payload = if subtype == "init" {
        SystemPayload::Init(from_value(value)?)
    } else {
        SystemPayload::Other {
            subtype: subtype.to_owned(),
            payload: value.clone(),
        }
    };

    Ok(Message::System(SystemMessage {
        session_id,
        payload,
    }))
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| DriverError::Parse(e.to_string()))
}

// ─── Serialization ────────────────────────────────────────────────────────

impl Message {
    /// Rebuild the wire object. The inverse of [`parse_message`] up to
    /// optional/absent field distinctions.
    pub fn to_value(&self) -> Value {
        match self {
            Message::System(m) => match &m.payload {
                SystemPayload::Init(init) => {
                    let mut obj = serde_json::to_value(init)
                        .unwrap_or_else(|_| json!({}))
                        .as_object()
                        .cloned()
                        .unwrap_or_default();
                    obj.insert("type".into(), json!("system"));
                    obj.insert("subtype".into(), json!("init"));
                    if let Some(id) = &m.session_id {
                        obj.insert("session_id".into(), json!(id));
                    }
                    Value::Object(obj)
                }
                SystemPayload::Other { payload, .. } => payload.clone(),
            },
            Message::Assistant(m) => {
                let wire = WireTurn {
                    message: WireTurnBody {
                        id: m.id.clone(),
                        role: Some("assistant".into()),
                        model: m.model.clone(),
                        content: m.content.clone(),
                        stop_reason: m.stop_reason.clone(),
                        stop_sequence: m.stop_sequence.clone(),
                        usage: m.usage.clone(),
                    },
                    parent_tool_use_id: m.parent_tool_use_id.clone(),
                    session_id: m.session_id.clone(),
                };
                tag(serde_json::to_value(wire), "assistant")
            }
            Message::User(m) => {
                let wire = WireTurn {
                    message: WireTurnBody {
                        id: None,
                        role: Some("user".into()),
                        model: None,
                        content: m.content.clone(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: None,
                    },
                    parent_tool_use_id: m.parent_tool_use_id.clone(),
                    session_id: m.session_id.clone(),
                };
                tag(serde_json::to_value(wire), "user")
            }
            Message::Result(m) => tag(serde_json::to_value(m), "result"),
            Message::StreamEvent(m) => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".into(), json!("stream_event"));
                obj.insert("event".into(), m.event.clone());
                if let Some(id) = &m.parent_tool_use_id {
                    obj.insert("parent_tool_use_id".into(), json!(id));
                }
                if let Some(id) = &m.session_id {
                    obj.insert("session_id".into(), json!(id));
                }
                Value::Object(obj)
            }
        }
    }
}

fn tag(value: std::result::Result<Value, serde_json::Error>, kind: &str) -> Value {
    let mut obj = value
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    obj.insert("type".into(), json!(kind));
    Value::Object(obj)
}

// ─── Tests ────────────────────────────────────────────────────────────────
