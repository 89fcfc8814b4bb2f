//! End-to-end scenarios against a scripted mock CLI.
//!
//! The mock is a shell script standing in for the `claude` binary: it
//! answers the initialize handshake, then reacts to stdin envelopes with
//! canned NDJSON, exercising the whole path from `Session` through the
//! local adapter and back.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use crate::hooks::{HookFn, HookOutput};
use crate::message::{ContentBlock, Message, MessageKind};
use crate::options::{CliPath, Options};
use crate::session::Session;
use crate::DriverError;

/// Route adapter/session tracing into the test harness; `RUST_LOG=debug`
/// shows the protocol traffic when a scenario misbehaves.
fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write a mock CLI that acknowledges the initialize handshake and then
/// runs `body` inside a `read -r line` loop over stdin.
fn mock_cli(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("claude-mock");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"#!/bin/sh
read -r line
id=${{line#*\"request_id\":\"}}
id=${{id%%\"*}}
printf '%s\n' "{{\"type\":\"control_response\",\"response\":{{\"subtype\":\"success\",\"request_id\":\"$id\",\"response\":{{\"commands\":[]}}}}}}"
while read -r line; do
{body}
done
"#
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn options_for(script: PathBuf) -> Options {
    Options {
        api_key: Some("test-key".into()),
        cli_path: Some(CliPath::Explicit(script)),
        timeout: Some(std::time::Duration::from_secs(10)),
        ..Default::default()
    }
}

#[tokio::test]
async fn simple_hello() {
    init_logs();
    let dir = tempfile::TempDir::new().unwrap();
    let body = r#"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"system","subtype":"init","session_id":"s1","model":"claude-sonnet-4-6","tools":[],"mcp_servers":[],"permission_mode":"default","claude_code_version":"2.1.0","cwd":"/tmp"}'
        printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"2+2 equals 4"}]},"session_id":"s1"}'
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"2+2 equals 4","num_turns":1,"total_cost_usd":0.002,"usage":{"input_tokens":5,"output_tokens":5}}'
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let summary = crate::query("Hello! What's 2+2?", options_for(script))
        .await
        .unwrap();
    assert_eq!(summary.result, "2+2 equals 4");
    assert_eq!(summary.session_id, "s1");
    assert!(!summary.is_error);
}

#[tokio::test]
async fn tool_chain_streams_every_message() {
    let dir = tempfile::TempDir::new().unwrap();
    let body = r##"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"system","subtype":"init","session_id":"s1","model":"claude-sonnet-4-6","tools":["View"],"mcp_servers":[],"permission_mode":"default","claude_code_version":"2.1.0","cwd":"/tmp"}'
        printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"Reading the file."},{"type":"tool_use","id":"tu_1","name":"View","input":{"file_path":"README.md"}}]},"session_id":"s1"}'
        printf '%s\n' '{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"tu_1","content":"# my project"}]},"parent_tool_use_id":null,"session_id":"s1"}'
        printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"The README says: my project"}]},"session_id":"s1"}'
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"The README says: my project","num_turns":2,"total_cost_usd":0.004,"usage":{"input_tokens":9,"output_tokens":9}}'
        ;;
    esac"##;
    let script = mock_cli(&dir, body);

    let session = Session::spawn(options_for(script)).await.unwrap();
    let stream = session
        .query_stream("Read file README.md")
        .await
        .unwrap();
    let messages: Vec<Message> = stream.map(|m| m.unwrap()).collect().await;

    let kinds: Vec<MessageKind> = messages.iter().map(Message::kind).collect();
    assert_eq!(
        kinds,
        vec![
            MessageKind::System,
            MessageKind::Assistant,
            MessageKind::User,
            MessageKind::Assistant,
            MessageKind::Result,
        ],
    );

    let Message::Assistant(first) = &messages[1] else {
        panic!("expected assistant");
    };
    let ContentBlock::ToolUse { name, input, .. } = &first.content[1] else {
        panic!("expected tool_use");
    };
    assert_eq!(name, "View");
    assert_eq!(input["file_path"], "README.md");

    let Message::User(tool_turn) = &messages[2] else {
        panic!("expected user");
    };
    let ContentBlock::ToolResult {
        content, is_error, ..
    } = &tool_turn.content[0]
    else {
        panic!("expected tool_result");
    };
    assert_eq!(content.as_ref().unwrap().as_text(), "# my project");
    assert!(!is_error);

    session.stop().await.unwrap();
}

#[tokio::test]
async fn permission_denial_via_can_use_tool() {
    let dir = tempfile::TempDir::new().unwrap();
    // The mock asks permission on every query and only finishes the turn
    // after a deny answer arrives on stdin.
    let body = r#"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"control_request","request_id":"cli_1","request":{"subtype":"can_use_tool","tool_name":"Write","input":{"file_path":"out.txt"},"tool_use_id":"tu_1"}}'
        ;;
    *'"behavior":"deny"'*)
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"I was not allowed to write the file.","num_turns":1,"total_cost_usd":0.001,"usage":{"input_tokens":4,"output_tokens":4}}'
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let asked = Arc::new(AtomicBool::new(false));
    let asked_in_callback = Arc::clone(&asked);
    let options = Options {
        can_use_tool: Some(Arc::new(HookFn(move |input: serde_json::Value,
                                                tool_use_id: Option<String>| {
            assert_eq!(input["tool_name"], "Write");
            assert_eq!(tool_use_id.as_deref(), Some("tu_1"));
            asked_in_callback.store(true, Ordering::SeqCst);
            Ok(HookOutput::Deny("blocked".into()))
        }))),
        ..options_for(script)
    };

    let session = Session::spawn(options).await.unwrap();
    let summary = session.query("Write out.txt please").await.unwrap();
    assert!(asked.load(Ordering::SeqCst), "permission callback ran");
    assert_eq!(summary.result, "I was not allowed to write the file.");
    session.stop().await.unwrap();
}

#[tokio::test]
async fn dynamic_model_switch() {
    let dir = tempfile::TempDir::new().unwrap();
    let body = r#"    case "$line" in
    *'"subtype":"set_model"'*)
        rid=${line#*\"request_id\":\"}
        rid=${rid%%\"*}
        printf '%s\n' "{\"type\":\"control_response\",\"response\":{\"subtype\":\"success\",\"request_id\":\"$rid\",\"response\":{\"model\":\"claude-sonnet-4-5-20250929\"}}}"
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let session = Session::spawn(options_for(script)).await.unwrap();
    let value = session.set_model("claude-sonnet-4-5-20250929").await.unwrap();
    assert_eq!(value["model"], "claude-sonnet-4-5-20250929");
    session.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_queries_run_serially_and_share_the_conversation() {
    let dir = tempfile::TempDir::new().unwrap();
    // Turns that carry the captured session id answer "resumed-N"; the
    // first turn (no id yet) answers "reply-N".
    let body = r#"    case "$line" in
    *'"session_id":"sess-e2e"'*'"type":"user"'*)
        i=$((i+1))
        printf '%s\n' "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"resumed-$i\"}]},\"session_id\":\"sess-e2e\"}"
        printf '%s\n' "{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"sess-e2e\",\"result\":\"resumed-$i\",\"num_turns\":1,\"total_cost_usd\":0.0,\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}"
        ;;
    *'"type":"user"'*)
        i=$((i+1))
        printf '%s\n' "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"reply-$i\"}]},\"session_id\":\"sess-e2e\"}"
        printf '%s\n' "{\"type\":\"result\",\"subtype\":\"success\",\"session_id\":\"sess-e2e\",\"result\":\"reply-$i\",\"num_turns\":1,\"total_cost_usd\":0.0,\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}"
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let session = Session::spawn(options_for(script)).await.unwrap();
    let s1 = session.query_stream("q1").await.unwrap();
    let s2 = session.query_stream("q2").await.unwrap();
    let s3 = session.query_stream("q3").await.unwrap();

    let (m1, m2, m3) = tokio::join!(
        s1.collect::<Vec<_>>(),
        s2.collect::<Vec<_>>(),
        s3.collect::<Vec<_>>(),
    );

    let last_text = |messages: &[crate::Result<Message>]| -> String {
        let Message::Result(result) = messages.last().unwrap().as_ref().unwrap() else {
            panic!("no result");
        };
        result.result_text().unwrap().to_owned()
    };

    // Strict FIFO: the mock numbers turns in arrival order, and from the
    // second turn on it sees the captured session id replayed.
    assert_eq!(last_text(&m1), "reply-1");
    assert_eq!(last_text(&m2), "resumed-2");
    assert_eq!(last_text(&m3), "resumed-3");
    assert_eq!(
        session.session_id().await.unwrap(),
        Some("sess-e2e".into()),
    );

    session.stop().await.unwrap();
}

#[tokio::test]
async fn buffer_overflow_fails_the_query_then_recovers() {
    init_logs();
    let dir = tempfile::TempDir::new().unwrap();
    // The first prompt triggers a 2048-byte line with no newline until the
    // end; later prompts behave normally.
    let body = r#"    case "$line" in
    *overflow-now*)
        long=A
        n=0
        while [ $n -lt 11 ]; do long=$long$long; n=$((n+1)); done
        printf '%s\n' "$long"
        ;;
    *'"type":"user"'*)
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"recovered","num_turns":1,"total_cost_usd":0.0,"usage":{"input_tokens":1,"output_tokens":1}}'
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let options = Options {
        max_buffer_size: Some(1024),
        ..options_for(script)
    };
    let session = Session::spawn(options).await.unwrap();

    let err = session.query("overflow-now").await.unwrap_err();
    assert!(
        matches!(err, DriverError::BufferOverflow { limit: 1024 }),
        "got {err}",
    );

    // Subsequent lines are consumed normally.
    let summary = session.query("a normal question").await.unwrap();
    assert_eq!(summary.result, "recovered");

    session.stop().await.unwrap();
}

#[tokio::test]
async fn error_max_turns_result_is_a_normal_terminal_with_is_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let body = r#"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"result","subtype":"error_max_turns","session_id":"s1","num_turns":10,"total_cost_usd":0.09,"is_error":true,"usage":{"input_tokens":50,"output_tokens":50}}'
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let session = Session::spawn(options_for(script)).await.unwrap();
    let summary = session.query("loop forever").await.unwrap();
    assert!(summary.is_error);
    assert_eq!(summary.subtype, "error_max_turns");
    assert_eq!(summary.result, "");
    assert_eq!(summary.num_turns, 10);
    session.stop().await.unwrap();
}

#[tokio::test]
async fn in_process_tools_answer_mcp_messages() {
    use crate::mcp::{SdkTool, ToolFn, ToolOutput, ToolSet};
    use crate::options::McpServerConfig;
    use std::collections::HashMap;

    let dir = tempfile::TempDir::new().unwrap();
    // On query: route a tools/call to the sdk server; once the mcp
    // response comes back over stdin, surface its sum in the result.
    let body = r#"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"control_request","request_id":"cli_9","request":{"subtype":"mcp_message","server_name":"calc","message":{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"add","arguments":{"a":19,"b":23}}}}}'
        ;;
    *'"sum":42'*)
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"the sum is 42","num_turns":1,"total_cost_usd":0.0,"usage":{"input_tokens":1,"output_tokens":1}}'
        ;;
    esac"#;
    let script = mock_cli(&dir, body);

    let calc = ToolSet::new("calc").tool(SdkTool::new(
        "add",
        "Add two integers",
        json!({"type": "object", "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}}}),
        Arc::new(ToolFn(|args: serde_json::Value| {
            let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
            Ok(ToolOutput::Json(json!({"sum": sum})))
        })),
    ));
    let mut servers = HashMap::new();
    servers.insert("calc".to_string(), McpServerConfig::Sdk(calc));

    let options = Options {
        mcp_servers: Some(servers),
        ..options_for(script)
    };
    let session = Session::spawn(options).await.unwrap();
    let summary = session.query("what is 19+23?").await.unwrap();
    assert_eq!(summary.result, "the sum is 42");
    session.stop().await.unwrap();
}
