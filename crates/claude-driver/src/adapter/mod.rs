use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::control::OutboundControl;
use crate::options::Options;
use crate::{DriverError, Result};

pub mod line_buffer;
pub mod local;
pub mod remote;
pub mod stub;

pub use local::LocalAdapter;
pub use remote::RemoteAdapter;
pub use stub::StubAdapter;

// ─── Status & notifications ───────────────────────────────────────────────

/// Where an adapter is in its lifecycle. Pushed to the session on every
/// transition.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterStatus {
    Provisioning,
    Initializing,
    Ready,
    Disconnected,
    Error(String),
}

/// Point-in-time health probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy(String),
}

/// Why a request finished without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Finished,
    Interrupted,
}

/// Message payloads may arrive decoded or as raw text. Transports that
/// shuttle NDJSON lines through without parsing (WebSocket passthrough)
/// hand the session the raw line; the session decodes it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Json(Value),
    Line(String),
}

impl RawPayload {
    pub fn decode(self) -> std::result::Result<Value, (String, serde_json::Error)> {
        match self {
            RawPayload::Json(value) => Ok(value),
            RawPayload::Line(line) => match serde_json::from_str(&line) {
                Ok(value) => Ok(value),
                Err(e) => Err((line, e)),
            },
        }
    }
}

/// The push channel from an adapter to its session.
#[derive(Debug)]
pub enum AdapterNotification {
    Status(AdapterStatus),
    RawMessage {
        request_id: String,
        payload: RawPayload,
    },
    Done {
        request_id: String,
        reason: DoneReason,
    },
    Error {
        request_id: String,
        error: DriverError,
    },
}

pub type NotificationSender = mpsc::Sender<AdapterNotification>;

/// Resolved with the control response, the 30 s timeout, or a disconnect,
/// whichever wins. Dropping the sender (adapter death) surfaces as a
/// receive error at the await site.
pub type ControlReceiver = oneshot::Receiver<Result<Value>>;

// ─── Contract ─────────────────────────────────────────────────────────────

/// The behavioral contract every transport implements: one bidirectional
/// JSON pipe with an eager provisioning lifecycle.
///
/// `start` must push `Provisioning` promptly and eventually either `Ready`
/// or `Error`; it may return before readiness. The session serializes
/// queries, so `send_query` is never called while another query is active.
/// Control support and cached server info are optional capabilities; the
/// defaults report them as unsupported.
#[async_trait]
pub trait Adapter: Send {
    /// Begin provisioning. Also used to re-provision after a disconnect.
    async fn start(&mut self, notifications: NotificationSender, options: &Options) -> Result<()>;

    /// Enqueue a prompt on the pipe. Non-blocking; messages flow back as
    /// notifications tagged with `request_id`.
    async fn send_query(&mut self, request_id: &str, prompt: &str, options: &Options)
        -> Result<()>;

    /// Ask the active query to stop. Best-effort.
    async fn interrupt(&mut self) -> Result<()>;

    fn health(&self) -> Health;

    /// Release all resources.
    async fn stop(&mut self);

    /// Optional capability: send a control request and get a handle that
    /// resolves with its outcome.
    async fn send_control_request(&mut self, control: OutboundControl) -> Result<ControlReceiver> {
        let _ = control;
        Err(DriverError::NotSupported("control requests"))
    }

    /// Optional capability: the cached initialize response.
    fn server_info(&self) -> Option<Value> {
        None
    }
}
