use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::{DriverError, Result};

/// How long an outbound control request may wait for its response.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the initialize handshake may take before the adapter gives up.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Classification ───────────────────────────────────────────────────────

/// What one decoded stdout object is: control traffic in either direction,
/// or a regular conversation message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponse),
    Message(Value),
}

/// A control request initiated by the CLI (permission prompts, hook
/// callbacks, traffic for in-process MCP servers).
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    pub request_id: String,
    pub subtype: String,
    pub request: Value,
}

/// The CLI's answer to one of our control requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlResponse {
    pub request_id: String,
    pub outcome: std::result::Result<Value, String>,
}

/// Split the two multiplexed conversations apart. Anything that is not
/// control traffic is a regular message, including objects this SDK does
/// not recognize; the message parser deals with those.
pub fn classify(value: Value) -> Inbound {
    match value.get("type").and_then(Value::as_str) {
        Some("control_request") => {
            let request_id = str_field(&value, "request_id").unwrap_or_default();
            let request = value.get("request").cloned().unwrap_or(Value::Null);
            let subtype = str_field(&request, "subtype").unwrap_or_default();
            Inbound::ControlRequest(ControlRequest {
                request_id,
                subtype,
                request,
            })
        }
        Some("control_response") => match parse_control_response(&value) {
            Ok(response) => Inbound::ControlResponse(response),
            // Malformed control responses degrade to regular messages so
            // the parser's debug-and-drop path handles them.
            Err(_) => Inbound::Message(value),
        },
        _ => Inbound::Message(value),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

// ─── Correlation ids ──────────────────────────────────────────────────────

/// Generates `req_<counter>_<hex>` correlation ids, counter monotonic per
/// adapter.
#[derive(Debug, Default)]
pub struct RequestIdGen {
    counter: AtomicU64,
}

impl RequestIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req_{n}_{:08x}", rand::random::<u32>())
    }
}

// ─── Outbound requests ────────────────────────────────────────────────────

/// Control requests this SDK can send to the CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundControl {
    Initialize {
        hooks: Option<Value>,
        agents: Option<Value>,
    },
    SetModel(String),
    SetPermissionMode(String),
    RewindFiles(Value),
    McpStatus,
    Interrupt,
}

impl OutboundControl {
    pub fn subtype(&self) -> &'static str {
        match self {
            OutboundControl::Initialize { .. } => "initialize",
            OutboundControl::SetModel(_) => "set_model",
            OutboundControl::SetPermissionMode(_) => "set_permission_mode",
            OutboundControl::RewindFiles(_) => "rewind_files",
            OutboundControl::McpStatus => "mcp_status",
            OutboundControl::Interrupt => "interrupt",
        }
    }

    /// The single-line envelope written to the pipe.
    pub fn to_envelope(&self, request_id: &str) -> Value {
        let mut request = Map::new();
        request.insert("subtype".into(), json!(self.subtype()));
        match self {
            OutboundControl::Initialize { hooks, agents } => {
                request.insert("hooks".into(), hooks.clone().unwrap_or(Value::Null));
                request.insert("agents".into(), agents.clone().unwrap_or(Value::Null));
            }
            OutboundControl::SetModel(model) => {
                request.insert("model".into(), json!(model));
            }
            OutboundControl::SetPermissionMode(mode) => {
                request.insert("mode".into(), json!(mode));
            }
            OutboundControl::RewindFiles(params) => {
                if let Some(obj) = params.as_object() {
                    for (k, v) in obj {
                        request.insert(k.clone(), v.clone());
                    }
                }
            }
            OutboundControl::McpStatus | OutboundControl::Interrupt => {}
        }
        json!({
            "type": "control_request",
            "request_id": request_id,
            "request": Value::Object(request),
        })
    }
}

// ─── Responses ────────────────────────────────────────────────────────────

/// Envelope answering an inbound CLI request successfully.
pub fn success_response(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": response,
        },
    })
}

/// Envelope answering an inbound CLI request with an error.
pub fn error_response(request_id: &str, message: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": message,
        },
    })
}

/// Decode a `control_response` envelope into its correlation id and
/// outcome.
pub fn parse_control_response(value: &Value) -> Result<ControlResponse> {
    let body = value
        .get("response")
        .ok_or_else(|| DriverError::Protocol("control_response without response body".into()))?;
    let request_id = str_field(body, "request_id")
        .ok_or_else(|| DriverError::Protocol("control_response without request_id".into()))?;
    let outcome = match body.get("subtype").and_then(Value::as_str) {
        Some("success") => Ok(body.get("response").cloned().unwrap_or(Value::Null)),
        Some("error") => Err(str_field(body, "error").unwrap_or_else(|| "unknown error".into())),
        other => {
            return Err(DriverError::Protocol(format!(
                "control_response with subtype {other:?}"
            )))
        }
    };
    Ok(ControlResponse {
        request_id,
        outcome,
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_splits_the_multiplexed_stream() {
        let req = json!({
            "type": "control_request",
            "request_id": "cli_1",
            "request": {"subtype": "can_use_tool", "tool_name": "Bash"},
        });
        let Inbound::ControlRequest(parsed) = classify(req) else {
            panic!("expected control request");
        };
        assert_eq!(parsed.request_id, "cli_1");
        assert_eq!(parsed.subtype, "can_use_tool");
        assert_eq!(parsed.request["tool_name"], "Bash");

        let resp = json!({
            "type": "control_response",
            "response": {"subtype": "success", "request_id": "req_1_aa", "response": {}},
        });
        assert!(matches!(classify(resp), Inbound::ControlResponse(_)));

        let msg = json!({"type": "assistant", "message": {"content": []}});
        assert!(matches!(classify(msg), Inbound::Message(_)));

        // No type field at all: still a regular message for the parser to
        // reject and log.
        assert!(matches!(classify(json!({"x": 1})), Inbound::Message(_)));
    }

    #[test]
    fn ids_are_monotonic_with_hex_suffix() {
        let ids = RequestIdGen::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(a.starts_with("req_1_"));
        assert!(b.starts_with("req_2_"));
        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn initialize_envelope_carries_hooks_and_agents() {
        let envelope = OutboundControl::Initialize {
            hooks: Some(json!({"PreToolUse": []})),
            agents: None,
        }
        .to_envelope("req_1_ab");
        assert_eq!(envelope["type"], "control_request");
        assert_eq!(envelope["request_id"], "req_1_ab");
        assert_eq!(envelope["request"]["subtype"], "initialize");
        assert_eq!(envelope["request"]["hooks"], json!({"PreToolUse": []}));
        assert_eq!(envelope["request"]["agents"], Value::Null);
    }

    #[test]
    fn subtype_builders() {
        let envelope = OutboundControl::SetModel("claude-sonnet-4-5-20250929".into())
            .to_envelope("req_2_cd");
        assert_eq!(envelope["request"]["subtype"], "set_model");
        assert_eq!(envelope["request"]["model"], "claude-sonnet-4-5-20250929");

        let envelope =
            OutboundControl::SetPermissionMode("acceptEdits".into()).to_envelope("req_3_ef");
        assert_eq!(envelope["request"]["mode"], "acceptEdits");

        let envelope = OutboundControl::RewindFiles(json!({"checkpoint": "c1"}))
            .to_envelope("req_4_00");
        assert_eq!(envelope["request"]["subtype"], "rewind_files");
        assert_eq!(envelope["request"]["checkpoint"], "c1");

        for (control, subtype) in [
            (OutboundControl::McpStatus, "mcp_status"),
            (OutboundControl::Interrupt, "interrupt"),
        ] {
            assert_eq!(control.to_envelope("id")["request"]["subtype"], subtype);
        }
    }

    #[test]
    fn envelopes_are_single_line() {
        let envelope = OutboundControl::Initialize {
            hooks: Some(json!({"note": "line\nbreak"})),
            agents: None,
        }
        .to_envelope("req_1_ab");
        assert!(!envelope.to_string().contains('\n'));
    }

    #[test]
    fn response_round_trip_under_projection() {
        let ok = success_response("cli_7", json!({"model": "m"}));
        let parsed = parse_control_response(&ok).unwrap();
        assert_eq!(parsed.request_id, "cli_7");
        assert_eq!(parsed.outcome, Ok(json!({"model": "m"})));

        let err = error_response("cli_8", "no such tool");
        let parsed = parse_control_response(&err).unwrap();
        assert_eq!(parsed.request_id, "cli_8");
        assert_eq!(parsed.outcome, Err("no such tool".into()));
    }

    #[test]
    fn success_without_payload_parses_as_null() {
        let value = json!({
            "type": "control_response",
            "response": {"subtype": "success", "request_id": "req_9_ff"},
        });
        let parsed = parse_control_response(&value).unwrap();
        assert_eq!(parsed.outcome, Ok(Value::Null));
    }

    #[test]
    fn malformed_control_response_degrades_to_message() {
        let value = json!({"type": "control_response", "response": {"subtype": "success"}});
        assert!(matches!(classify(value), Inbound::Message(_)));
    }
}
