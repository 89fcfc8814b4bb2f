use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::adapter::line_buffer::{LineBuffer, LineEvent};
use crate::adapter::{
    Adapter, AdapterNotification, AdapterStatus, ControlReceiver, Health, NotificationSender,
    RawPayload,
};
use crate::cli_path;
use crate::command::{build_argv, user_envelope};
use crate::control::{
    classify, error_response, success_response, Inbound, OutboundControl, RequestIdGen,
    CONTROL_TIMEOUT, INITIALIZE_TIMEOUT,
};
use crate::hooks::HookRegistry;
use crate::mcp::McpRouter;
use crate::options::Options;
use crate::{DriverError, Result};

// ─── LocalAdapter ─────────────────────────────────────────────────────────

/// Drives the `claude` binary as a child process over stdin/stdout.
///
/// The actual work happens on a spawned task owning the child, the stdin
/// writer, and the line buffer; the handle talks to it over a command
/// channel. If the child dies while idle, the next `start` call from the
/// session re-provisions a fresh child lazily.
pub struct LocalAdapter {
    command_tx: Option<mpsc::Sender<Command>>,
    server_info: Arc<Mutex<Option<Value>>>,
    status: Arc<Mutex<AdapterStatus>>,
    stopped: bool,
}

enum Command {
    Query {
        request_id: String,
        prompt: String,
        session_id: Option<String>,
    },
    Control {
        control: OutboundControl,
        reply: oneshot::Sender<Result<Value>>,
    },
    ExpireControl {
        correlation_id: String,
    },
    Interrupt,
    Stop,
}

impl LocalAdapter {
    pub fn new() -> Self {
        LocalAdapter {
            command_tx: None,
            server_info: Arc::new(Mutex::new(None)),
            status: Arc::new(Mutex::new(AdapterStatus::Disconnected)),
            stopped: false,
        }
    }

    fn running_tx(&self) -> Option<mpsc::Sender<Command>> {
        self.command_tx
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    async fn start(&mut self, notifications: NotificationSender, options: &Options) -> Result<()> {
        if self.stopped {
            return Err(DriverError::Disconnected("adapter stopped".into()));
        }
        // A loop in a terminal status is on its way out even if its channel
        // has not closed yet; replace it. Anything else is still live.
        let replaceable = matches!(
            &*self.status.lock().expect("status lock"),
            AdapterStatus::Disconnected | AdapterStatus::Error(_),
        );
        if self.running_tx().is_some() && !replaceable {
            return Ok(());
        }

        // Provisioning is acknowledged before the child exists so the
        // session can start queueing immediately.
        let shared = SharedState {
            notifications,
            server_info: Arc::clone(&self.server_info),
            status: Arc::clone(&self.status),
        };
        shared.set_status(AdapterStatus::Provisioning).await;

        let (tx, rx) = mpsc::channel(64);
        self.command_tx = Some(tx.clone());

        let registry = Arc::new(HookRegistry::build(
            options.hooks.as_ref(),
            options.can_use_tool.clone(),
        ));
        let router = Arc::new(McpRouter::new(options.sdk_tool_sets()));
        let options = options.clone();

        tokio::spawn(async move {
            run_loop(rx, tx, shared, options, registry, router).await;
        });
        Ok(())
    }

    async fn send_query(
        &mut self,
        request_id: &str,
        prompt: &str,
        options: &Options,
    ) -> Result<()> {
        let tx = self
            .running_tx()
            .ok_or_else(|| DriverError::Disconnected("adapter is not running".into()))?;
        tx.send(Command::Query {
            request_id: request_id.to_owned(),
            prompt: prompt.to_owned(),
            session_id: options.resume.clone(),
        })
        .await
        .map_err(|_| DriverError::Disconnected("adapter loop exited".into()))
    }

    async fn interrupt(&mut self) -> Result<()> {
        let tx = self
            .running_tx()
            .ok_or_else(|| DriverError::Disconnected("adapter is not running".into()))?;
        tx.send(Command::Interrupt)
            .await
            .map_err(|_| DriverError::Disconnected("adapter loop exited".into()))
    }

    fn health(&self) -> Health {
        if self.stopped {
            return Health::Unhealthy("adapter stopped".into());
        }
        match &*self.status.lock().expect("status lock") {
            AdapterStatus::Ready => Health::Healthy,
            AdapterStatus::Error(reason) => Health::Unhealthy(reason.clone()),
            _ => Health::Degraded,
        }
    }

    async fn stop(&mut self) {
        self.stopped = true;
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Stop).await;
        }
    }

    async fn send_control_request(&mut self, control: OutboundControl) -> Result<ControlReceiver> {
        let tx = self
            .running_tx()
            .ok_or_else(|| DriverError::Disconnected("adapter is not running".into()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Command::Control {
            control,
            reply: reply_tx,
        })
        .await
        .map_err(|_| DriverError::Disconnected("adapter loop exited".into()))?;
        Ok(reply_rx)
    }

    fn server_info(&self) -> Option<Value> {
        self.server_info.lock().expect("server_info lock").clone()
    }
}

// ─── Loop state ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct SharedState {
    notifications: NotificationSender,
    server_info: Arc<Mutex<Option<Value>>>,
    status: Arc<Mutex<AdapterStatus>>,
}

impl SharedState {
    async fn set_status(&self, status: AdapterStatus) {
        info!(?status, "adapter status");
        *self.status.lock().expect("status lock") = status.clone();
        let _ = self
            .notifications
            .send(AdapterNotification::Status(status))
            .await;
    }

    async fn notify(&self, notification: AdapterNotification) {
        let _ = self.notifications.send(notification).await;
    }
}

struct Pipe {
    stdin: ChildStdin,
}

impl Pipe {
    /// Single-line JSON write; the loop is the only writer so no lock is
    /// needed.
    async fn write_line(&mut self, value: &Value) -> std::io::Result<()> {
        let mut line = value.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }
}

// ─── The loop ─────────────────────────────────────────────────────────────

async fn run_loop(
    mut command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shared: SharedState,
    options: Options,
    registry: Arc<HookRegistry>,
    router: Arc<McpRouter>,
) {
    // Binary resolution and spawn happen here, off the caller's path.
    let program = match cli_path::resolve(&options.cli_path()) {
        Ok(p) => p,
        Err(e) => {
            shared.set_status(AdapterStatus::Error(e.to_string())).await;
            return;
        }
    };

    let mut command = build_process(&program, &options);
    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            shared
                .set_status(AdapterStatus::Error(
                    DriverError::SpawnFailed(e).to_string(),
                ))
                .await;
            return;
        }
    };

    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            shared
                .set_status(AdapterStatus::Error("child pipes were not captured".into()))
                .await;
            let _ = child.kill().await;
            return;
        }
    };
    let mut stdout = stdout;
    let mut pipe = Pipe { stdin };

    shared.set_status(AdapterStatus::Initializing).await;

    // The initialize handshake gates readiness.
    let ids = RequestIdGen::new();
    let init_id = ids.next_id();
    let init = OutboundControl::Initialize {
        hooks: registry.wire_format().cloned(),
        agents: options
            .agents
            .as_ref()
            .and_then(|a| serde_json::to_value(a).ok()),
    };
    if pipe.write_line(&init.to_envelope(&init_id)).await.is_err() {
        shared
            .set_status(AdapterStatus::Error("could not reach the child's stdin".into()))
            .await;
        let _ = child.kill().await;
        return;
    }

    let mut state = LoopState {
        pending: HashMap::new(),
        active_request: None,
        initialized: false,
        init_id,
        ids,
        shared: shared.clone(),
        registry,
        router,
    };

    let mut buffer = LineBuffer::new(options.max_buffer_size());
    let mut chunk = [0u8; 8192];
    let init_timeout = tokio::time::sleep(INITIALIZE_TIMEOUT);
    tokio::pin!(init_timeout);

    loop {
        tokio::select! {
            _ = &mut init_timeout, if !state.initialized => {
                shared
                    .set_status(AdapterStatus::Error(
                        DriverError::InitializeTimeout(INITIALIZE_TIMEOUT.as_secs()).to_string(),
                    ))
                    .await;
                state.fail_pending("initialize timed out");
                let _ = child.kill().await;
                return;
            }

            read = stdout.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => {
                        state.disconnect().await;
                        let _ = child.kill().await;
                        return;
                    }
                    Ok(n) => n,
                };
                for event in buffer.push(&chunk[..n]) {
                    match event {
                        LineEvent::Overflow { limit } => state.on_overflow(limit).await,
                        LineEvent::Line(line) => {
                            if state.on_line(&line, &mut pipe).await.is_err() {
                                state.disconnect().await;
                                let _ = child.kill().await;
                                return;
                            }
                        }
                    }
                }
            }

            cmd = command_rx.recv() => {
                let stop = match cmd {
                    None | Some(Command::Stop) => true,
                    Some(cmd) => {
                        match state.on_command(cmd, &mut pipe, &command_tx).await {
                            Ok(()) => false,
                            Err(_) => {
                                state.disconnect().await;
                                let _ = child.kill().await;
                                return;
                            }
                        }
                    }
                };
                if stop {
                    state.fail_pending("adapter stopped");
                    shared.set_status(AdapterStatus::Disconnected).await;
                    let _ = child.kill().await;
                    return;
                }
            }
        }
    }
}

/// Assemble the subprocess invocation: argv from the option table plus the
/// environment the CLI expects from an embedding SDK.
fn build_process(program: &std::path::Path, options: &Options) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(build_argv(options));

    // Works both from a terminal and from inside a running Claude session.
    cmd.env_remove("CLAUDECODE");
    cmd.env("CLAUDE_CODE_ENTRYPOINT", "sdk-rust");
    if let Some(key) = &options.api_key {
        cmd.env("ANTHROPIC_API_KEY", key);
    }
    if let Some(betas) = &options.betas {
        if !betas.is_empty() {
            cmd.env("ANTHROPIC_BETAS", betas.join(","));
        }
    }
    for (k, v) in options.env.iter().flatten() {
        cmd.env(k, v);
    }
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    cmd.stderr(if options.include_stderr == Some(true) {
        Stdio::inherit()
    } else {
        Stdio::null()
    });
    cmd.kill_on_drop(true);
    cmd
}

struct LoopState {
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
    active_request: Option<String>,
    initialized: bool,
    init_id: String,
    ids: RequestIdGen,
    shared: SharedState,
    registry: Arc<HookRegistry>,
    router: Arc<McpRouter>,
}

impl LoopState {
    async fn on_overflow(&mut self, limit: usize) {
        warn!(limit, "dropped an oversized stdout line");
        if let Some(request_id) = self.active_request.take() {
            self.shared
                .notify(AdapterNotification::Error {
                    request_id,
                    error: DriverError::BufferOverflow { limit },
                })
                .await;
        }
    }

    async fn on_line(&mut self, line: &str, pipe: &mut Pipe) -> std::io::Result<()> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, line, "dropping undecodable stdout line");
                return Ok(());
            }
        };

        match classify(value) {
            Inbound::ControlResponse(response) => {
                if response.request_id == self.init_id {
                    match response.outcome {
                        Ok(info) => {
                            *self.shared.server_info.lock().expect("server_info lock") =
                                Some(info);
                            self.initialized = true;
                            self.shared.set_status(AdapterStatus::Ready).await;
                        }
                        Err(message) => {
                            self.shared
                                .set_status(AdapterStatus::Error(format!(
                                    "initialize rejected: {message}"
                                )))
                                .await;
                            self.fail_pending("initialize rejected");
                        }
                    }
                } else if let Some(reply) = self.pending.remove(&response.request_id) {
                    let _ = reply.send(
                        response
                            .outcome
                            .map_err(DriverError::ControlFailed),
                    );
                } else {
                    debug!(
                        request_id = %response.request_id,
                        "control response for an unknown or expired request",
                    );
                }
            }

            Inbound::ControlRequest(request) => {
                let envelope = match request.subtype.as_str() {
                    "can_use_tool" => {
                        let tool_use_id = request
                            .request
                            .get("tool_use_id")
                            .and_then(Value::as_str)
                            .map(str::to_owned);
                        let wire = self
                            .registry
                            .dispatch_can_use_tool(request.request.clone(), tool_use_id)
                            .await;
                        success_response(&request.request_id, wire)
                    }
                    "hook_callback" => {
                        let callback_id = request
                            .request
                            .get("callback_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        let input = request
                            .request
                            .get("input")
                            .cloned()
                            .unwrap_or(Value::Null);
                        match self.registry.dispatch_hook(&callback_id, input).await {
                            Ok(wire) => success_response(&request.request_id, wire),
                            Err(e) => error_response(&request.request_id, &e.to_string()),
                        }
                    }
                    "mcp_message" => {
                        let server = request
                            .request
                            .get("server_name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        let message = request
                            .request
                            .get("message")
                            .cloned()
                            .unwrap_or(Value::Null);
                        let response = self.router.handle(&server, message).await;
                        let mcp_response = response
                            .and_then(|r| serde_json::to_value(r).ok())
                            .unwrap_or(Value::Null);
                        success_response(
                            &request.request_id,
                            json!({"mcp_response": mcp_response}),
                        )
                    }
                    other => error_response(
                        &request.request_id,
                        &format!("unsupported control request subtype: {other}"),
                    ),
                };
                pipe.write_line(&envelope).await?;
            }

            Inbound::Message(value) => {
                let is_result =
                    value.get("type").and_then(Value::as_str) == Some("result");
                match &self.active_request {
                    Some(request_id) => {
                        self.shared
                            .notify(AdapterNotification::RawMessage {
                                request_id: request_id.clone(),
                                payload: RawPayload::Json(value),
                            })
                            .await;
                        if is_result {
                            // The session delivers the terminal signal after
                            // it has parsed and forwarded the result, which
                            // keeps the ordering guarantee.
                            self.active_request = None;
                        }
                    }
                    None => {
                        debug!("dropping a message with no active request");
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_command(
        &mut self,
        command: Command,
        pipe: &mut Pipe,
        command_tx: &mpsc::Sender<Command>,
    ) -> std::io::Result<()> {
        match command {
            Command::Query {
                request_id,
                prompt,
                session_id,
            } => {
                self.active_request = Some(request_id);
                pipe.write_line(&user_envelope(&prompt, session_id.as_deref()))
                    .await?;
            }
            Command::Control { control, reply } => {
                let correlation_id = self.ids.next_id();
                pipe.write_line(&control.to_envelope(&correlation_id)).await?;
                self.pending.insert(correlation_id.clone(), reply);

                // Each entry carries its own timer; the response and the
                // timer race, and whichever runs first removes the entry.
                let tx = command_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(CONTROL_TIMEOUT).await;
                    let _ = tx.send(Command::ExpireControl { correlation_id }).await;
                });
            }
            Command::ExpireControl { correlation_id } => {
                if let Some(reply) = self.pending.remove(&correlation_id) {
                    let _ = reply.send(Err(DriverError::ControlTimeout(
                        CONTROL_TIMEOUT.as_secs(),
                    )));
                }
            }
            Command::Interrupt => {
                // Untracked: the query's own terminal notification reports
                // the interruption.
                let correlation_id = self.ids.next_id();
                pipe.write_line(&OutboundControl::Interrupt.to_envelope(&correlation_id))
                    .await?;
            }
            Command::Stop => unreachable!("handled by the loop"),
        }
        Ok(())
    }

    /// Child exited or the pipe broke: fail everything in flight.
    async fn disconnect(&mut self) {
        if let Some(request_id) = self.active_request.take() {
            self.shared
                .notify(AdapterNotification::Error {
                    request_id,
                    error: DriverError::Disconnected("the claude process exited".into()),
                })
                .await;
        }
        self.fail_pending("port closed");
        self.shared.set_status(AdapterStatus::Disconnected).await;
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(DriverError::Disconnected(reason.into())));
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CliPath;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Write a mock CLI shell script that answers the initialize handshake
    /// and then runs `body` in a read loop over stdin lines (`$line`).
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
            ..Default::default()
        }
    }

    async fn next_status(rx: &mut mpsc::Receiver<AdapterNotification>) -> AdapterStatus {
        loop {
            match rx.recv().await.expect("notification channel open") {
                AdapterNotification::Status(status) => return status,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn provisions_through_to_ready() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = mock_cli(&dir, "    :");
        let (tx, mut rx) = mpsc::channel(64);

        let mut adapter = LocalAdapter::new();
        adapter.start(tx, &options_for(script)).await.unwrap();

        assert_eq!(next_status(&mut rx).await, AdapterStatus::Provisioning);
        assert_eq!(next_status(&mut rx).await, AdapterStatus::Initializing);
        assert_eq!(next_status(&mut rx).await, AdapterStatus::Ready);
        assert_eq!(adapter.health(), Health::Healthy);
        assert!(adapter.server_info().is_some());

        adapter.stop().await;
    }

    #[tokio::test]
    async fn missing_binary_surfaces_an_error_status() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut adapter = LocalAdapter::new();
        adapter
            .start(tx, &options_for("/nonexistent/claude-mock".into()))
            .await
            .unwrap();

        assert_eq!(next_status(&mut rx).await, AdapterStatus::Provisioning);
        let AdapterStatus::Error(reason) = next_status(&mut rx).await else {
            panic!("expected error status");
        };
        assert!(reason.contains("claude binary not found"));
        assert!(matches!(adapter.health(), Health::Unhealthy(_)));
    }

    #[tokio::test]
    async fn forwards_query_messages_tagged_with_the_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = r#"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]},"session_id":"s1"}'
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"hi","num_turns":1,"total_cost_usd":0.0}'
        ;;
    esac"#;
        let script = mock_cli(&dir, body);
        let (tx, mut rx) = mpsc::channel(64);

        let mut adapter = LocalAdapter::new();
        let options = options_for(script);
        adapter.start(tx, &options).await.unwrap();
        while next_status(&mut rx).await != AdapterStatus::Ready {}

        adapter.send_query("rq-1", "say hi", &options).await.unwrap();

        let mut payloads = Vec::new();
        while payloads.len() < 2 {
            if let AdapterNotification::RawMessage {
                request_id,
                payload,
            } = rx.recv().await.unwrap()
            {
                assert_eq!(request_id, "rq-1");
                payloads.push(payload.decode().unwrap());
            }
        }
        assert_eq!(payloads[0]["type"], "assistant");
        assert_eq!(payloads[1]["type"], "result");

        adapter.stop().await;
    }

    #[tokio::test]
    async fn child_exit_fails_the_active_request_and_disconnects() {
        let dir = tempfile::TempDir::new().unwrap();
        // Exit as soon as a query arrives, mid-conversation.
        let body = r#"    case "$line" in
    *'"type":"user"'*) exit 0 ;;
    esac"#;
        let script = mock_cli(&dir, body);
        let (tx, mut rx) = mpsc::channel(64);

        let mut adapter = LocalAdapter::new();
        let options = options_for(script);
        adapter.start(tx, &options).await.unwrap();
        while next_status(&mut rx).await != AdapterStatus::Ready {}

        adapter.send_query("rq-1", "bye", &options).await.unwrap();

        let mut saw_error = false;
        let mut saw_disconnect = false;
        while !(saw_error && saw_disconnect) {
            match rx.recv().await.unwrap() {
                AdapterNotification::Error { request_id, error } => {
                    assert_eq!(request_id, "rq-1");
                    assert!(matches!(error, DriverError::Disconnected(_)));
                    saw_error = true;
                }
                AdapterNotification::Status(AdapterStatus::Disconnected) => {
                    saw_disconnect = true;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn restart_after_disconnect_reprovisions() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = r#"    case "$line" in
    *'"type":"user"'*) exit 0 ;;
    esac"#;
        let script = mock_cli(&dir, body);
        let (tx, mut rx) = mpsc::channel(64);

        let mut adapter = LocalAdapter::new();
        let options = options_for(script);
        adapter.start(tx.clone(), &options).await.unwrap();
        while next_status(&mut rx).await != AdapterStatus::Ready {}
        adapter.send_query("rq-1", "die", &options).await.unwrap();
        while next_status(&mut rx).await != AdapterStatus::Disconnected {}

        // Lazy reconnection: a fresh start walks the lifecycle again.
        adapter.start(tx, &options).await.unwrap();
        assert_eq!(next_status(&mut rx).await, AdapterStatus::Provisioning);
        assert_eq!(next_status(&mut rx).await, AdapterStatus::Initializing);
        assert_eq!(next_status(&mut rx).await, AdapterStatus::Ready);

        adapter.stop().await;
    }

    #[tokio::test]
    async fn answers_can_use_tool_requests_over_stdin() {
        use crate::hooks::{HookFn, HookOutput};

        let dir = tempfile::TempDir::new().unwrap();
        // On query: ask permission; echo a marker only after a deny comes
        // back, then finish the turn.
        let body = r#"    case "$line" in
    *'"type":"user"'*)
        printf '%s\n' '{"type":"control_request","request_id":"cli_1","request":{"subtype":"can_use_tool","tool_name":"Write","input":{"file_path":"x"},"tool_use_id":"tu_9"}}'
        ;;
    *'"behavior":"deny"'*)
        printf '%s\n' '{"type":"result","subtype":"success","session_id":"s1","result":"denied as asked","num_turns":1,"total_cost_usd":0.0}'
        ;;
    esac"#;
        let script = mock_cli(&dir, body);
        let (tx, mut rx) = mpsc::channel(64);

        let mut adapter = LocalAdapter::new();
        let options = Options {
            can_use_tool: Some(Arc::new(HookFn(|_input: Value, tool_use_id: Option<String>| {
                assert_eq!(tool_use_id.as_deref(), Some("tu_9"));
                Ok(HookOutput::Deny("blocked".into()))
            }))),
            ..options_for(script)
        };
        adapter.start(tx, &options).await.unwrap();
        while next_status(&mut rx).await != AdapterStatus::Ready {}

        adapter
            .send_query("rq-1", "write a file", &options)
            .await
            .unwrap();

        let result = loop {
            if let AdapterNotification::RawMessage { payload, .. } = rx.recv().await.unwrap() {
                let value = payload.decode().unwrap();
                if value["type"] == "result" {
                    break value;
                }
            }
        };
        assert_eq!(result["result"], "denied as asked");

        adapter.stop().await;
    }
}
