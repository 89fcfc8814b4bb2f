use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info};

use crate::adapter::{
    Adapter, AdapterNotification, AdapterStatus, DoneReason, Health, NotificationSender,
    RawPayload,
};
use crate::options::Options;
use crate::{DriverError, Result};

/// Version of the sidecar envelope protocol this adapter speaks.
pub const PROTOCOL_VERSION: u32 = 1;

// ─── Envelope protocol ────────────────────────────────────────────────────

/// Frames this adapter sends to the sidecar. Distinct from the CLI's own
/// control protocol: the sidecar runs a local adapter internally and only
/// needs session lifecycle plus query routing from us.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Init {
        options: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        workspace_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume: Option<String>,
        protocol_version: u32,
    },
    Query {
        request_id: String,
        prompt: String,
        options: Value,
    },
    Stop,
    Interrupt,
}

/// Frames the sidecar sends back. `Message.payload` is a raw CLI NDJSON
/// line passed through verbatim; this adapter never parses it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Ready {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        protocol_version: Option<u32>,
    },
    Message {
        request_id: String,
        payload: String,
    },
    Done {
        request_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        #[serde(default)]
        request_id: Option<String>,
        code: String,
        #[serde(default)]
        details: Option<String>,
    },
}

// ─── RemoteAdapter ────────────────────────────────────────────────────────

/// Connection settings for a sidecar.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// WebSocket endpoint, e.g. `wss://sandbox.example.com/session`.
    pub url: String,
    /// Bearer token for the `Authorization` header.
    pub token: Option<String>,
    /// Workspace the sidecar should provision the CLI in.
    pub workspace_id: Option<String>,
}

/// The adapter contract over a WebSocket to a sidecar that owns the CLI on
/// its side. Control requests are not supported on this transport; the
/// sidecar handles hooks and permissions where the CLI runs.
pub struct RemoteAdapter {
    config: RemoteConfig,
    command_tx: Option<mpsc::Sender<RemoteCommand>>,
    status: Arc<Mutex<AdapterStatus>>,
    stopped: bool,
}

enum RemoteCommand {
    Query {
        request_id: String,
        prompt: String,
        options: Value,
    },
    Interrupt,
    Stop,
}

impl RemoteAdapter {
    pub fn new(config: RemoteConfig) -> Self {
        RemoteAdapter {
            config,
            command_tx: None,
            status: Arc::new(Mutex::new(AdapterStatus::Disconnected)),
            stopped: false,
        }
    }

    fn running_tx(&self) -> Option<mpsc::Sender<RemoteCommand>> {
        self.command_tx
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

#[async_trait]
impl Adapter for RemoteAdapter {
    async fn start(&mut self, notifications: NotificationSender, options: &Options) -> Result<()> {
        if self.stopped {
            return Err(DriverError::Disconnected("adapter stopped".into()));
        }
        if self.running_tx().is_some() {
            return Ok(());
        }

        let shared = Shared {
            notifications,
            status: Arc::clone(&self.status),
        };
        shared.set_status(AdapterStatus::Provisioning).await;

        let (tx, rx) = mpsc::channel(64);
        self.command_tx = Some(tx);

        let config = self.config.clone();
        let init = ClientEnvelope::Init {
            options: options.remote_wire(),
            workspace_id: config.workspace_id.clone(),
            resume: options.resume.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        tokio::spawn(async move {
            run_loop(config, init, rx, shared).await;
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
        tx.send(RemoteCommand::Query {
            request_id: request_id.to_owned(),
            prompt: prompt.to_owned(),
            options: options.remote_wire(),
        })
        .await
        .map_err(|_| DriverError::Disconnected("adapter loop exited".into()))
    }

    async fn interrupt(&mut self) -> Result<()> {
        let tx = self
            .running_tx()
            .ok_or_else(|| DriverError::Disconnected("adapter is not running".into()))?;
        tx.send(RemoteCommand::Interrupt)
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
            let _ = tx.send(RemoteCommand::Stop).await;
        }
    }
}

// ─── Loop ─────────────────────────────────────────────────────────────────

struct Shared {
    notifications: NotificationSender,
    status: Arc<Mutex<AdapterStatus>>,
}

impl Shared {
    async fn set_status(&self, status: AdapterStatus) {
        info!(?status, "remote adapter status");
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

async fn run_loop(
    config: RemoteConfig,
    init: ClientEnvelope,
    mut command_rx: mpsc::Receiver<RemoteCommand>,
    shared: Shared,
) {
    let mut request = match config.url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            shared
                .set_status(AdapterStatus::Error(format!("invalid sidecar url: {e}")))
                .await;
            return;
        }
    };
    if let Some(token) = &config.token {
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(value) => {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(e) => {
                shared
                    .set_status(AdapterStatus::Error(format!("invalid bearer token: {e}")))
                    .await;
                return;
            }
        }
    }

    let (ws, _) = match connect_async(request).await {
        Ok(ok) => ok,
        Err(e) => {
            shared
                .set_status(AdapterStatus::Error(
                    DriverError::WebSocket(e.to_string()).to_string(),
                ))
                .await;
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    shared.set_status(AdapterStatus::Initializing).await;
    if send_envelope(&mut sink, &init).await.is_err() {
        shared.set_status(AdapterStatus::Disconnected).await;
        return;
    }

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let envelope: ServerEnvelope = match serde_json::from_str(text.as_str()) {
                            Ok(e) => e,
                            Err(e) => {
                                debug!(error = %e, "dropping unrecognized sidecar frame");
                                continue;
                            }
                        };
                        if handle_envelope(envelope, &shared).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        shared.set_status(AdapterStatus::Disconnected).await;
                        return;
                    }
                    Some(Err(e)) => {
                        shared
                            .set_status(AdapterStatus::Error(
                                DriverError::WebSocket(e.to_string()).to_string(),
                            ))
                            .await;
                        return;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to do
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    None | Some(RemoteCommand::Stop) => {
                        let _ = send_envelope(&mut sink, &ClientEnvelope::Stop).await;
                        let _ = sink.send(WsMessage::Close(None)).await;
                        shared.set_status(AdapterStatus::Disconnected).await;
                        return;
                    }
                    Some(RemoteCommand::Query { request_id, prompt, options }) => {
                        let envelope = ClientEnvelope::Query { request_id, prompt, options };
                        if send_envelope(&mut sink, &envelope).await.is_err() {
                            shared.set_status(AdapterStatus::Disconnected).await;
                            return;
                        }
                    }
                    Some(RemoteCommand::Interrupt) => {
                        let _ = send_envelope(&mut sink, &ClientEnvelope::Interrupt).await;
                    }
                }
            }
        }
    }
}

/// Map one sidecar frame to the adapter notification channel. `Err` means
/// the connection is unusable and the loop must end.
async fn handle_envelope(
    envelope: ServerEnvelope,
    shared: &Shared,
) -> std::result::Result<(), ()> {
    match envelope {
        ServerEnvelope::Ready {
            protocol_version, ..
        } => {
            if let Some(version) = protocol_version {
                if version != PROTOCOL_VERSION {
                    shared
                        .set_status(AdapterStatus::Error(
                            DriverError::ProtocolVersion(version, PROTOCOL_VERSION).to_string(),
                        ))
                        .await;
                    return Err(());
                }
            }
            shared.set_status(AdapterStatus::Ready).await;
        }
        ServerEnvelope::Message {
            request_id,
            payload,
        } => {
            shared
                .notify(AdapterNotification::RawMessage {
                    request_id,
                    payload: RawPayload::Line(payload),
                })
                .await;
        }
        ServerEnvelope::Done { request_id, reason } => {
            let reason = match reason.as_deref() {
                Some("interrupted") => DoneReason::Interrupted,
                _ => DoneReason::Finished,
            };
            shared
                .notify(AdapterNotification::Done { request_id, reason })
                .await;
        }
        ServerEnvelope::Error {
            request_id,
            code,
            details,
        } => {
            shared
                .notify(AdapterNotification::Error {
                    request_id: request_id.unwrap_or_default(),
                    error: DriverError::Remote {
                        code,
                        details: details.unwrap_or_default(),
                    },
                })
                .await;
        }
    }
    Ok(())
}

async fn send_envelope<S>(sink: &mut S, envelope: &ClientEnvelope) -> std::result::Result<(), ()>
where
    S: Sink<WsMessage> + Unpin,
{
    let json = serde_json::to_string(envelope).map_err(|_| ())?;
    sink.send(WsMessage::Text(json.into())).await.map_err(|_| ())
}

// ─── Tests ────────────────────────────────────────────────────────────────
