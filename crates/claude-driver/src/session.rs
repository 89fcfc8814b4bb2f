use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, warn, Instrument};

use crate::adapter::{
    Adapter, AdapterNotification, AdapterStatus, DoneReason, Health, LocalAdapter,
    NotificationSender,
};
use crate::control::OutboundControl;
use crate::message::{ContentBlock, Message};
use crate::options::{Options, PermissionMode};
use crate::stream::{MessageStream, RunSummary, StreamItem};
use crate::{DriverError, Result};

// ─── Public handle ────────────────────────────────────────────────────────

/// A long-lived conversation with one CLI child (or remote sidecar).
///
/// All public methods funnel through the session actor's mailbox, so
/// concurrent callers are serialized and queries run strictly in FIFO
/// order. The CLI holds one conversation per process; reordering queries
/// would reorder the conversation.
pub struct Session {
    command_tx: mpsc::Sender<SessionCommand>,
    events_rx: StdMutex<Option<mpsc::Receiver<SessionEvent>>>,
}

/// Out-of-band delivery for [`Session::query_async`] subscribers.
#[derive(Debug)]
pub struct SessionEvent {
    pub request_id: String,
    pub event: SessionEventKind,
}

#[derive(Debug)]
pub enum SessionEventKind {
    Message(Message),
    Done(DoneReason),
    Error(DriverError),
}

impl Session {
    /// Start a session over a local CLI subprocess.
    pub async fn spawn(options: Options) -> Result<Session> {
        Session::with_adapter(LocalAdapter::new(), options).await
    }

    /// Start a session over any adapter. Provisioning begins eagerly;
    /// queries submitted before readiness queue and run once the adapter
    /// reports `Ready`.
    pub async fn with_adapter<A>(adapter: A, options: Options) -> Result<Session>
    where
        A: Adapter + 'static,
    {
        options.validate()?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (notify_tx, notify_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);

        let mut adapter: Box<dyn Adapter> = Box::new(adapter);
        adapter.start(notify_tx.clone(), &options).await?;

        let span = info_span!("session", name = options.name.as_deref().unwrap_or("default"));
        let actor = Actor {
            adapter,
            options,
            notify_tx,
            command_rx,
            notify_rx,
            events_tx,
            command_tx: command_tx.clone(),
            status: AdapterStatus::Provisioning,
            requests: HashMap::new(),
            queue: VecDeque::new(),
            active: None,
            session_id: None,
        };
        tokio::spawn(actor.run().instrument(span));

        Ok(Session {
            command_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        })
    }

    /// Run a query to completion and return its terminal summary.
    pub async fn query(&self, prompt: impl Into<String>) -> Result<RunSummary> {
        self.query_with(prompt, Options::default()).await
    }

    pub async fn query_with(
        &self,
        prompt: impl Into<String>,
        overrides: Options,
    ) -> Result<RunSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(prompt.into(), overrides, QueryMode::Sync { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| DriverError::SessionStopped)?
    }

    /// Stream every message of a query; the stream ends after the result.
    pub async fn query_stream(&self, prompt: impl Into<String>) -> Result<MessageStream> {
        self.query_stream_with(prompt, Options::default()).await
    }

    pub async fn query_stream_with(
        &self,
        prompt: impl Into<String>,
        overrides: Options,
    ) -> Result<MessageStream> {
        let (tx, rx) = mpsc::channel(64);
        self.submit(prompt.into(), overrides, QueryMode::Stream { tx })
            .await?;
        Ok(MessageStream::new(rx))
    }

    /// Fire a query and return its request id immediately; messages and the
    /// terminal signal arrive on the [`Session::events`] channel.
    pub async fn query_async(&self, prompt: impl Into<String>) -> Result<String> {
        self.query_async_with(prompt, Options::default()).await
    }

    pub async fn query_async_with(
        &self,
        prompt: impl Into<String>,
        overrides: Options,
    ) -> Result<String> {
        self.submit(prompt.into(), overrides, QueryMode::Async).await
    }

    /// Take the out-of-band event receiver. Yields `None` after the first
    /// call: there is exactly one subscriber side.
    pub fn events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().expect("events lock").take()
    }

    /// Ask the adapter to stop the active query. Best-effort; the query
    /// finishes with an interrupted terminal signal.
    pub async fn interrupt(&self) -> Result<()> {
        self.roundtrip(|reply| SessionCommand::Interrupt { reply })
            .await?
    }

    pub async fn set_model(&self, model: impl Into<String>) -> Result<Value> {
        self.control(OutboundControl::SetModel(model.into())).await
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<Value> {
        self.control(OutboundControl::SetPermissionMode(mode.as_str().into()))
            .await
    }

    pub async fn mcp_status(&self) -> Result<Value> {
        self.control(OutboundControl::McpStatus).await
    }

    pub async fn rewind_files(&self, params: Value) -> Result<Value> {
        self.control(OutboundControl::RewindFiles(params)).await
    }

    /// The cached initialize response, when the adapter kept one.
    pub async fn server_info(&self) -> Result<Option<Value>> {
        self.roundtrip(|reply| SessionCommand::ServerInfo { reply })
            .await
    }

    /// The conversation id captured from the CLI, once any message carried
    /// one.
    pub async fn session_id(&self) -> Result<Option<String>> {
        self.roundtrip(|reply| SessionCommand::GetSessionId { reply })
            .await
    }

    /// Forget the captured conversation id; the next query starts a fresh
    /// conversation.
    pub async fn clear_session_id(&self) -> Result<()> {
        self.roundtrip(|reply| SessionCommand::ClearSessionId { reply })
            .await
    }

    pub async fn health(&self) -> Result<Health> {
        self.roundtrip(|reply| SessionCommand::Health { reply }).await
    }

    /// Shut down the session: stops the adapter and fails everything still
    /// queued or active.
    pub async fn stop(&self) -> Result<()> {
        self.roundtrip(|reply| SessionCommand::Stop { reply }).await
    }

    async fn control(&self, control: OutboundControl) -> Result<Value> {
        self.roundtrip(|reply| SessionCommand::Control { control, reply })
            .await?
    }

    async fn submit(&self, prompt: String, overrides: Options, mode: QueryMode) -> Result<String> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Query {
                prompt,
                overrides: Box::new(overrides),
                mode,
                ack: ack_tx,
            })
            .await
            .map_err(|_| DriverError::SessionStopped)?;
        ack_rx.await.map_err(|_| DriverError::SessionStopped)?
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| DriverError::SessionStopped)?;
        rx.await.map_err(|_| DriverError::SessionStopped)
    }
}

// ─── Actor internals ──────────────────────────────────────────────────────

enum SessionCommand {
    Query {
        prompt: String,
        overrides: Box<Options>,
        mode: QueryMode,
        ack: oneshot::Sender<Result<String>>,
    },
    Interrupt {
        reply: oneshot::Sender<Result<()>>,
    },
    Control {
        control: OutboundControl,
        reply: oneshot::Sender<Result<Value>>,
    },
    ServerInfo {
        reply: oneshot::Sender<Option<Value>>,
    },
    GetSessionId {
        reply: oneshot::Sender<Option<String>>,
    },
    ClearSessionId {
        reply: oneshot::Sender<()>,
    },
    Health {
        reply: oneshot::Sender<Health>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    RequestExpired {
        request_id: String,
    },
}

enum QueryMode {
    Sync {
        reply: oneshot::Sender<Result<RunSummary>>,
    },
    Stream {
        tx: mpsc::Sender<StreamItem>,
    },
    Async,
}

struct RequestRecord {
    prompt: String,
    options: Options,
    mode: QueryMode,
    #[allow(dead_code)]
    queued_at: chrono::DateTime<chrono::Utc>,
    deadline: Option<tokio::task::JoinHandle<()>>,
    subscriber_gone: bool,
    /// Stashed result for sync delivery at the terminal signal, so the
    /// reply and the done ordering stay consistent.
    summary: Option<RunSummary>,
}

struct Actor {
    adapter: Box<dyn Adapter>,
    options: Options,
    notify_tx: NotificationSender,
    command_rx: mpsc::Receiver<SessionCommand>,
    notify_rx: mpsc::Receiver<AdapterNotification>,
    events_tx: mpsc::Sender<SessionEvent>,
    command_tx: mpsc::Sender<SessionCommand>,
    status: AdapterStatus,
    requests: HashMap<String, RequestRecord>,
    queue: VecDeque<String>,
    active: Option<String>,
    session_id: Option<String>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        None => {
                            // Every handle is gone; tear down.
                            self.shutdown().await;
                            return;
                        }
                        Some(SessionCommand::Stop { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(command) => self.on_command(command).await,
                    }
                }
                notification = self.notify_rx.recv() => {
                    match notification {
                        None => {
                            // Unreachable while the actor holds a sender
                            // clone, but never spin on a closed channel.
                            self.fail_everything(DriverError::Disconnected(
                                "adapter channel closed".into(),
                            ))
                            .await;
                            return;
                        }
                        Some(notification) => self.on_notification(notification).await,
                    }
                }
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Query {
                prompt,
                overrides,
                mode,
                ack,
            } => {
                let merged = Options::resolve(&[&self.options, overrides.as_ref()]);
                if let Err(e) = merged.validate() {
                    let _ = ack.send(Err(e));
                    return;
                }

                let request_id = uuid::Uuid::new_v4().to_string();
                let deadline = {
                    let tx = self.command_tx.clone();
                    let id = request_id.clone();
                    let timeout = merged.timeout();
                    Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        let _ = tx.send(SessionCommand::RequestExpired { request_id: id }).await;
                    }))
                };

                self.requests.insert(
                    request_id.clone(),
                    RequestRecord {
                        prompt,
                        options: merged,
                        mode,
                        queued_at: chrono::Utc::now(),
                        deadline,
                        subscriber_gone: false,
                        summary: None,
                    },
                );
                self.queue.push_back(request_id.clone());
                let _ = ack.send(Ok(request_id));
                self.pump().await;
            }
            SessionCommand::Interrupt { reply } => {
                let _ = reply.send(self.adapter.interrupt().await);
            }
            SessionCommand::Control { control, reply } => {
                match self.adapter.send_control_request(control).await {
                    Ok(receiver) => {
                        // Await off the actor so a slow response cannot
                        // stall message routing.
                        tokio::spawn(async move {
                            let outcome = match receiver.await {
                                Ok(outcome) => outcome,
                                Err(_) => Err(DriverError::Disconnected(
                                    "adapter closed the control channel".into(),
                                )),
                            };
                            let _ = reply.send(outcome);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            SessionCommand::ServerInfo { reply } => {
                let _ = reply.send(self.adapter.server_info());
            }
            SessionCommand::GetSessionId { reply } => {
                let _ = reply.send(self.session_id.clone());
            }
            SessionCommand::ClearSessionId { reply } => {
                self.session_id = None;
                let _ = reply.send(());
            }
            SessionCommand::Health { reply } => {
                let _ = reply.send(self.adapter.health());
            }
            SessionCommand::RequestExpired { request_id } => {
                if !self.requests.contains_key(&request_id) {
                    return;
                }
                let secs = self
                    .requests
                    .get(&request_id)
                    .map(|r| r.options.timeout().as_secs())
                    .unwrap_or_default();
                if self.active.as_deref() == Some(request_id.as_str()) {
                    let _ = self.adapter.interrupt().await;
                }
                self.terminal(&request_id, Err(DriverError::RequestTimeout(secs)))
                    .await;
            }
            SessionCommand::Stop { .. } => unreachable!("handled by the loop"),
        }
    }

    async fn on_notification(&mut self, notification: AdapterNotification) {
        match notification {
            AdapterNotification::Status(status) => {
                self.status = status.clone();
                match status {
                    AdapterStatus::Ready => self.pump().await,
                    AdapterStatus::Error(reason) => {
                        self.fail_everything(DriverError::ProvisioningFailed(reason))
                            .await;
                    }
                    _ => {}
                }
            }
            AdapterNotification::RawMessage {
                request_id,
                payload,
            } => {
                if !self.requests.contains_key(&request_id) {
                    debug!(%request_id, "message for an unknown request");
                    return;
                }
                let value = match payload.decode() {
                    Ok(value) => value,
                    Err((line, error)) => {
                        debug!(%error, line, "dropping undecodable payload");
                        return;
                    }
                };
                let message = match crate::message::parse_message(&value) {
                    Ok(message) => message,
                    Err(error) => {
                        debug!(%error, "dropping unparseable message");
                        return;
                    }
                };

                if let Some(sid) = message.session_id().filter(|s| !s.is_empty()) {
                    self.session_id = Some(sid.to_owned());
                }
                self.run_tool_callback(&request_id, &message);

                let is_result = if let Message::Result(result) = &message {
                    if let Some(record) = self.requests.get_mut(&request_id) {
                        record.summary = Some(RunSummary::from(result));
                    }
                    true
                } else {
                    false
                };

                self.deliver_message(&request_id, message).await;

                if is_result {
                    // The result is always the last element a subscriber
                    // sees before its done sentinel.
                    self.terminal(&request_id, Ok(DoneReason::Finished)).await;
                }
            }
            AdapterNotification::Done { request_id, reason } => {
                self.terminal(&request_id, Ok(reason)).await;
            }
            AdapterNotification::Error { request_id, error } => {
                self.terminal(&request_id, Err(error)).await;
            }
        }
    }

    /// Hand the queue head to the adapter when it is idle and ready. When
    /// the adapter died while idle, kick off lazy re-provisioning instead;
    /// the queue drains on the next `Ready`.
    async fn pump(&mut self) {
        // A failed adapter poisons everything submitted after the failure
        // too, until a reconnect clears it.
        if let AdapterStatus::Error(reason) = &self.status {
            let reason = reason.clone();
            let ids: Vec<String> = self.queue.drain(..).collect();
            for id in ids {
                self.finish(&id, Err(DriverError::ProvisioningFailed(reason.clone())))
                    .await;
            }
            return;
        }

        if self.status == AdapterStatus::Disconnected && !self.queue.is_empty() {
            let notify = self.notify_tx.clone();
            if self.adapter.start(notify, &self.options).await.is_ok() {
                self.status = AdapterStatus::Provisioning;
            }
            return;
        }

        while self.active.is_none() && self.status == AdapterStatus::Ready {
            let Some(request_id) = self.queue.pop_front() else {
                return;
            };
            let Some(record) = self.requests.get(&request_id) else {
                continue;
            };

            let mut options = record.options.clone();
            if options.resume.is_none() {
                // Conversation continuity: replay the captured id.
                options.resume = self.session_id.clone();
            }
            let prompt = record.prompt.clone();

            match self.adapter.send_query(&request_id, &prompt, &options).await {
                Ok(()) => {
                    self.active = Some(request_id);
                    return;
                }
                Err(e) => {
                    self.finish(&request_id, Err(e)).await;
                }
            }
        }
    }

    fn run_tool_callback(&self, request_id: &str, message: &Message) {
        let Some(record) = self.requests.get(request_id) else {
            return;
        };
        let Some(callback) = record.options.tool_callback.clone() else {
            return;
        };
        if let Message::Assistant(assistant) = message {
            for block in &assistant.content {
                if let ContentBlock::ToolUse { name, input, .. } = block {
                    let callback = callback.clone();
                    let name = name.clone();
                    let input = input.clone();
                    tokio::spawn(async move {
                        callback.on_tool_use(&name, &input).await;
                    });
                }
            }
        }
    }

    async fn deliver_message(&mut self, request_id: &str, message: Message) {
        let Some(record) = self.requests.get_mut(request_id) else {
            return;
        };
        match &record.mode {
            QueryMode::Sync { .. } => {}
            QueryMode::Stream { tx } => {
                if record.subscriber_gone {
                    return;
                }
                if tx.send(StreamItem::Message(message)).await.is_err() {
                    // The consumer dropped the stream mid-way. The request
                    // still runs to completion; its messages are discarded.
                    record.subscriber_gone = true;
                }
            }
            QueryMode::Async => {
                let _ = self
                    .events_tx
                    .send(SessionEvent {
                        request_id: request_id.to_owned(),
                        event: SessionEventKind::Message(message),
                    })
                    .await;
            }
        }
    }

    /// Deliver exactly one terminal signal, release the record, and move
    /// the queue along.
    async fn terminal(&mut self, request_id: &str, outcome: Result<DoneReason>) {
        self.finish(request_id, outcome).await;
        self.pump().await;
    }

    /// The delivery half of [`Actor::terminal`]. Kept separate so `pump`
    /// can fail a dispatch without recursing back into itself.
    async fn finish(&mut self, request_id: &str, outcome: Result<DoneReason>) {
        let Some(record) = self.requests.remove(request_id) else {
            return;
        };
        self.queue.retain(|id| id != request_id);
        if self.active.as_deref() == Some(request_id) {
            self.active = None;
        }
        if let Some(deadline) = &record.deadline {
            deadline.abort();
        }

        match record.mode {
            QueryMode::Sync { reply } => {
                let response = match outcome {
                    Ok(DoneReason::Interrupted) => Err(DriverError::Interrupted),
                    Ok(DoneReason::Finished) => match record.summary {
                        Some(summary) => Ok(summary),
                        None => Err(DriverError::Protocol(
                            "query finished without a result message".into(),
                        )),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(response);
            }
            QueryMode::Stream { tx } => {
                if !record.subscriber_gone {
                    let item = match outcome {
                        Ok(reason) => StreamItem::Done(reason),
                        Err(e) => StreamItem::Error(e),
                    };
                    let _ = tx.send(item).await;
                }
            }
            QueryMode::Async => {
                let event = match outcome {
                    Ok(reason) => SessionEventKind::Done(reason),
                    Err(e) => SessionEventKind::Error(e),
                };
                let _ = self
                    .events_tx
                    .send(SessionEvent {
                        request_id: request_id.to_owned(),
                        event,
                    })
                    .await;
            }
        }
    }

    async fn fail_everything(&mut self, error: DriverError) {
        let ids: Vec<String> = self.requests.keys().cloned().collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), %error, "failing all tracked requests");
        }
        for id in ids {
            self.finish(&id, Err(error.duplicate())).await;
        }
    }

    async fn shutdown(&mut self) {
        self.adapter.stop().await;
        self.fail_everything(DriverError::SessionStopped).await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
