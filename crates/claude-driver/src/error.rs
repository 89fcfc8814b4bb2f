use thiserror::Error;

/// Everything that can go wrong between a caller and the `claude` subprocess.
///
/// The variant is the stable contract; the embedded detail strings are
/// advisory. Decode and parse failures are recovered where they occur and
/// only logged; they appear here so lower layers can report them upward
/// without panicking.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("claude binary not found: {guidance}")]
    CliNotFound { guidance: String },

    #[error("failed to spawn claude: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("adapter disconnected: {0}")]
    Disconnected(String),

    #[error("failed to decode stream-json line: {source}\n  line: {line}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unrecognized message shape: {0}")]
    Parse(String),

    #[error("no control response within {0} seconds")]
    ControlTimeout(u64),

    #[error("initialize handshake not acknowledged within {0} seconds")]
    InitializeTimeout(u64),

    #[error("adapter provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("line exceeded max_buffer_size ({limit} bytes) without a newline")]
    BufferOverflow { limit: usize },

    #[error("query exceeded its {0} second deadline")]
    RequestTimeout(u64),

    #[error("invalid option '{option}': {reason}")]
    Config {
        option: &'static str,
        reason: String,
    },

    #[error("hook callback failed: {0}")]
    Callback(String),

    #[error("control request failed: {0}")]
    ControlFailed(String),

    #[error("adapter does not support {0}")]
    NotSupported(&'static str),

    #[error("remote adapter error ({code}): {details}")]
    Remote { code: String, details: String },

    #[error("remote peer speaks protocol version {0}, expected {1}")]
    ProtocolVersion(u32, u32),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session stopped")]
    SessionStopped,

    #[error("query interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Clone-ish helper for fan-out paths that must deliver the same failure
    /// to several requests. `DriverError` holds an `io::Error` so it cannot
    /// derive `Clone`; this preserves the variant and the rendered detail.
    pub(crate) fn duplicate(&self) -> DriverError {
        use DriverError::*;
        match self {
            CliNotFound { guidance } => CliNotFound {
                guidance: guidance.clone(),
            },
            Disconnected(r) => Disconnected(r.clone()),
            ControlTimeout(s) => ControlTimeout(*s),
            InitializeTimeout(s) => InitializeTimeout(*s),
            ProvisioningFailed(r) => ProvisioningFailed(r.clone()),
            BufferOverflow { limit } => BufferOverflow { limit: *limit },
            RequestTimeout(s) => RequestTimeout(*s),
            Config { option, reason } => Config {
                option,
                reason: reason.clone(),
            },
            Callback(r) => Callback(r.clone()),
            ControlFailed(r) => ControlFailed(r.clone()),
            NotSupported(what) => NotSupported(what),
            Remote { code, details } => Remote {
                code: code.clone(),
                details: details.clone(),
            },
            ProtocolVersion(got, want) => ProtocolVersion(*got, *want),
            WebSocket(r) => WebSocket(r.clone()),
            Protocol(r) => Protocol(r.clone()),
            SessionStopped => SessionStopped,
            Interrupted => Interrupted,
            other => Protocol(other.to_string()),
        }
    }
}
