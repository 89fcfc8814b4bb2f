//! `claude-driver` — drive the Claude CLI as a long-lived subprocess.
//!
//! The CLI speaks newline-delimited JSON over stdin/stdout in its
//! bidirectional stream-json mode. This crate owns the child process,
//! multiplexes the control protocol (permissions, hooks, in-process MCP
//! servers) with the conversation message stream, and presents sessions,
//! typed message streams, and callbacks to caller code.
//!
//! # Architecture
//!
//! ```text
//! Options ──▶ Session ──▶ Adapter (local subprocess / WebSocket / stub)
//!                │              │ NDJSON lines + control envelopes
//!                │              ▼
//!                │        classify ──▶ control codec ──▶ hooks / MCP router
//!                │              │
//!                ▼              ▼ raw messages
//!          MessageStream ◀── message parser
//! ```
//!
//! Each session is an actor owning one adapter; each adapter owns one
//! child process (or one socket). Queries are strictly serialized per
//! session because the CLI holds one conversation per process.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use claude_driver::{query, Options};
//!
//! let summary = query(
//!     "Write a hello-world Rust function.",
//!     Options {
//!         model: Some("claude-sonnet-4-6".into()),
//!         api_key: Some(std::env::var("ANTHROPIC_API_KEY")?),
//!         ..Default::default()
//!     },
//! )
//! .await?;
//! println!("{}", summary.result);
//! ```
//!
//! For multi-turn conversations, keep a [`Session`] around:
//!
//! ```rust,ignore
//! use claude_driver::{Options, Session};
//! use futures::StreamExt;
//!
//! let session = Session::spawn(options).await?;
//! let mut stream = session.query_stream("What's 2+2?").await?;
//! while let Some(message) = stream.next().await {
//!     println!("{:?}", message?);
//! }
//! let followup = session.query("And doubled?").await?; // same conversation
//! session.stop().await?;
//! ```

pub mod adapter;
pub mod cli_path;
pub mod command;
pub mod control;
pub mod error;
pub mod hooks;
pub mod mcp;
pub mod message;
pub mod options;
pub mod session;
pub mod stream;

#[cfg(test)]
mod tests;

pub use adapter::{
    Adapter, AdapterNotification, AdapterStatus, DoneReason, Health, LocalAdapter, RawPayload,
    RemoteAdapter, StubAdapter,
};
pub use adapter::remote::RemoteConfig;
pub use error::DriverError;
pub use hooks::{HookCallback, HookEvent, HookFn, HookMatcher, HookOutput, ToolCallback};
pub use mcp::{SdkTool, ToolFn, ToolHandler, ToolOutput, ToolSet};
pub use message::{
    AssistantMessage, ContentBlock, Message, MessageKind, ResultMessage, SystemInit,
    SystemMessage, SystemPayload, TokenUsage, UserMessage,
};
pub use options::{CliPath, McpServerConfig, Options, PermissionMode, ToolsConfig};
pub use session::{Session, SessionEvent, SessionEventKind};
pub use stream::{MessageStream, RunSummary, ToolInvocation};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Drive a single query to completion on a throwaway session.
///
/// Spawns a local session, runs the prompt, stops the session, and returns
/// the terminal [`RunSummary`]. Use [`Session`] directly when you need
/// conversation continuity, streaming, or control calls.
pub async fn query(prompt: impl Into<String>, options: Options) -> Result<RunSummary> {
    let session = Session::spawn(options).await?;
    let outcome = session.query(prompt).await;
    let _ = session.stop().await;
    outcome
}
