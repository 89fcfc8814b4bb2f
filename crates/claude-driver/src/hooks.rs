use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::{DriverError, Result};

// ─── Events ───────────────────────────────────────────────────────────────

/// Lifecycle events the CLI invokes caller hooks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    SubagentStart,
    PreCompact,
    Notification,
}

impl HookEvent {
    /// All events, in the order callback ids are assigned.
    pub const ALL: [HookEvent; 9] = [
        HookEvent::PreToolUse,
        HookEvent::PostToolUse,
        HookEvent::PostToolUseFailure,
        HookEvent::UserPromptSubmit,
        HookEvent::Stop,
        HookEvent::SubagentStop,
        HookEvent::SubagentStart,
        HookEvent::PreCompact,
        HookEvent::Notification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PostToolUseFailure => "PostToolUseFailure",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::SubagentStart => "SubagentStart",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::Notification => "Notification",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Callback outcome ─────────────────────────────────────────────────────

/// What a hook or permission callback decided.
///
/// Permission callbacks (`can_use_tool`) use the `Allow*`/`Deny*` variants;
/// observational hooks typically return `Ok` or one of the flow-control
/// variants. The wire translation is [`HookOutput::to_wire`].
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutput {
    /// Let the tool run with its input untouched.
    Allow,
    /// Let the tool run with a replacement input.
    AllowWithInput(Value),
    /// Let the tool run with a replacement input and updated permission
    /// rules. The permission list is forwarded verbatim; the CLI validates
    /// its shape.
    AllowWithPermissions(Value, Value),
    /// Refuse the tool call.
    Deny(String),
    /// Refuse the tool call and interrupt the whole query.
    DenyAndInterrupt(String),
    /// Observational acknowledgement, no behavior change.
    Ok,
    /// Stop the conversation with a reason.
    ContinueWithReason(String),
    /// Block a submitted prompt.
    RejectPrompt(String),
    /// Inject custom instructions into the conversation.
    Instructions(String),
}

impl HookOutput {
    pub fn to_wire(&self) -> Value {
        match self {
            HookOutput::Allow => json!({"behavior": "allow"}),
            HookOutput::AllowWithInput(input) => {
                json!({"behavior": "allow", "updatedInput": input})
            }
            HookOutput::AllowWithPermissions(input, perms) => json!({
                "behavior": "allow",
                "updatedInput": input,
                "updatedPermissions": perms,
            }),
            HookOutput::Deny(msg) => json!({"behavior": "deny", "message": msg}),
            HookOutput::DenyAndInterrupt(msg) => {
                json!({"behavior": "deny", "message": msg, "interrupt": true})
            }
            HookOutput::Ok => json!({}),
            HookOutput::ContinueWithReason(reason) => {
                json!({"continue": false, "stopReason": reason})
            }
            HookOutput::RejectPrompt(reason) => {
                json!({"decision": "block", "reason": reason})
            }
            HookOutput::Instructions(text) => {
                json!({"hookSpecificOutput": {"customInstructions": text}})
            }
        }
    }
}

// ─── Callback traits ──────────────────────────────────────────────────────

/// A caller-provided callback the CLI can invoke mid-query.
///
/// `input` is the event payload as the CLI sent it; `tool_use_id` is present
/// for tool-scoped events. Implementations run on the adapter's task, so a
/// slow callback applies backpressure to the CLI naturally.
#[async_trait]
pub trait HookCallback: Send + Sync {
    async fn call(&self, input: Value, tool_use_id: Option<String>) -> Result<HookOutput>;
}

/// Adapter for plain (non-async) functions.
pub struct HookFn<F>(pub F);

#[async_trait]
impl<F> HookCallback for HookFn<F>
where
    F: Fn(Value, Option<String>) -> Result<HookOutput> + Send + Sync,
{
    async fn call(&self, input: Value, tool_use_id: Option<String>) -> Result<HookOutput> {
        (self.0)(input, tool_use_id)
    }
}

/// Observational callback invoked for every `ToolUse` block the session
/// routes. No return value; it cannot influence execution.
#[async_trait]
pub trait ToolCallback: Send + Sync {
    async fn on_tool_use(&self, name: &str, input: &Value);
}

/// One matcher entry under a hook event: an optional tool-name pattern, the
/// callbacks it fires, and an optional per-invocation timeout in seconds.
#[derive(Clone)]
pub struct HookMatcher {
    pub matcher: Option<String>,
    pub callbacks: Vec<Arc<dyn HookCallback>>,
    pub timeout: Option<u64>,
}

impl HookMatcher {
    pub fn new(matcher: Option<&str>, callbacks: Vec<Arc<dyn HookCallback>>) -> Self {
        HookMatcher {
            matcher: matcher.map(str::to_owned),
            callbacks,
            timeout: None,
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────

/// Callback ids assigned across a session's hook configuration, plus the
/// wire-format object the initialize handshake carries.
///
/// Ids are `hook_0`, `hook_1`, ... assigned across events in
/// [`HookEvent::ALL`] order so the assignment is deterministic for a given
/// configuration.
pub struct HookRegistry {
    by_id: HashMap<String, Arc<dyn HookCallback>>,
    permission: Option<Arc<dyn HookCallback>>,
    wire: Option<Value>,
}

impl HookRegistry {
    pub fn build(
        hooks: Option<&HashMap<HookEvent, Vec<HookMatcher>>>,
        can_use_tool: Option<Arc<dyn HookCallback>>,
    ) -> Self {
        let mut by_id = HashMap::new();
        let mut events = serde_json::Map::new();
        let mut next = 0usize;

        if let Some(hooks) = hooks {
            for event in HookEvent::ALL {
                let Some(matchers) = hooks.get(&event) else {
                    continue;
                };
                let mut entries = Vec::with_capacity(matchers.len());
                for m in matchers {
                    let mut ids = Vec::with_capacity(m.callbacks.len());
                    for cb in &m.callbacks {
                        let id = format!("hook_{next}");
                        next += 1;
                        by_id.insert(id.clone(), Arc::clone(cb));
                        ids.push(id);
                    }
                    let mut entry = serde_json::Map::new();
                    entry.insert("matcher".into(), json!(m.matcher));
                    entry.insert("hookCallbackIds".into(), json!(ids));
                    if let Some(t) = m.timeout {
                        entry.insert("timeout".into(), json!(t));
                    }
                    entries.push(Value::Object(entry));
                }
                events.insert(event.as_str().into(), Value::Array(entries));
            }
        }

        let wire = if events.is_empty() && can_use_tool.is_none() {
            None
        } else {
            Some(Value::Object(events))
        };

        HookRegistry {
            by_id,
            permission: can_use_tool,
            wire,
        }
    }

    /// Registry with no hooks at all; `wire_format` is `None`.
    pub fn empty() -> Self {
        Self::build(None, None)
    }

    /// The `hooks` object for the initialize request, or `None` when neither
    /// hooks nor a permission callback were configured.
    pub fn wire_format(&self) -> Option<&Value> {
        self.wire.as_ref()
    }

    pub fn has_permission_callback(&self) -> bool {
        self.permission.is_some()
    }

    /// Answer an inbound `can_use_tool` control request. Always produces a
    /// wire object; a missing callback or a failed one denies.
    pub async fn dispatch_can_use_tool(&self, input: Value, tool_use_id: Option<String>) -> Value {
        let Some(cb) = &self.permission else {
            return HookOutput::Deny("no permission callback configured".into()).to_wire();
        };
        match invoke(Arc::clone(cb), input, tool_use_id).await {
            Ok(output) => output.to_wire(),
            Err(e) => {
                warn!(error = %e, "permission callback failed; denying");
                HookOutput::Deny(format!("Hook error: {e}")).to_wire()
            }
        }
    }

    /// Answer an inbound `hook_callback` control request. A failed callback
    /// degrades to the empty observational response rather than wedging the
    /// query.
    pub async fn dispatch_hook(&self, callback_id: &str, input: Value) -> Result<Value> {
        let cb = self
            .by_id
            .get(callback_id)
            .ok_or_else(|| DriverError::Protocol(format!("unknown hook callback id {callback_id}")))?;
        match invoke(Arc::clone(cb), input, None).await {
            Ok(output) => Ok(output.to_wire()),
            Err(e) => {
                warn!(callback_id, error = %e, "hook callback failed; ignoring");
                Ok(json!({}))
            }
        }
    }
}

/// Run a callback on its own task so a panic is contained as an error
/// instead of taking the adapter down with it.
async fn invoke(
    cb: Arc<dyn HookCallback>,
    input: Value,
    tool_use_id: Option<String>,
) -> Result<HookOutput> {
    match tokio::spawn(async move { cb.call(input, tool_use_id).await }).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => Err(DriverError::Callback("callback panicked".into())),
        Err(join) => Err(DriverError::Callback(join.to_string())),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
