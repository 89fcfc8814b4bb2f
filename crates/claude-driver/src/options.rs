use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::hooks::{HookCallback, HookEvent, HookMatcher, ToolCallback};
use crate::mcp::ToolSet;
use crate::{DriverError, Result};

/// Hard cap on a single NDJSON line from the CLI, unless overridden.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Overall per-query deadline, unless overridden.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Enumerated option values ─────────────────────────────────────────────

/// Permission mode — controls how tool executions are authorized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PermissionMode {
    /// Standard: prompts for dangerous operations
    #[default]
    Default,
    /// Auto-accept file edit operations
    AcceptEdits,
    /// Bypass all permission checks
    BypassPermissions,
    /// Planning mode, no actual tool execution
    Plan,
    /// Don't prompt; deny if not pre-approved
    DontAsk,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
            PermissionMode::DontAsk => "dontAsk",
        }
    }
}

/// Where the `claude` binary comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CliPath {
    /// The pinned binary under the SDK's private directory. Not downloaded
    /// here; resolution fails with installation guidance when it is absent.
    #[default]
    Bundled,
    /// Whatever `claude` PATH and the usual install locations turn up.
    Global,
    /// An explicit path, used verbatim.
    Explicit(PathBuf),
}

/// The `tools` option: a named preset or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolsConfig {
    Preset(String),
    List(Vec<String>),
}

/// One entry in the `mcp_servers` mapping.
#[derive(Clone)]
pub enum McpServerConfig {
    /// A conventional stdio server the CLI spawns itself.
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    /// An in-process tool set served back over the control protocol.
    Sdk(ToolSet),
}

impl fmt::Debug for McpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            McpServerConfig::Stdio { command, args, .. } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .finish(),
            McpServerConfig::Sdk(set) => {
                f.debug_struct("Sdk").field("name", &set.name).finish()
            }
        }
    }
}

// ─── Options ──────────────────────────────────────────────────────────────

/// Options for a session or a single query.
///
/// Every field is optional; `None` means "not set at this tier". Values are
/// resolved across four tiers (query > session > application defaults >
/// built-in defaults) by [`Options::resolve`], then checked once by
/// [`Options::validate`] and reused for the life of the session or query.
#[derive(Clone, Default)]
pub struct Options {
    /// Anthropic API key, exported to the child as `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,
    /// Model name (e.g. `"claude-sonnet-4-6"`).
    pub model: Option<String>,
    /// Model to fall back to when the primary is overloaded.
    pub fallback_model: Option<String>,
    /// Replace the CLI's default system prompt.
    pub system_prompt: Option<String>,
    /// Text appended to the default system prompt.
    pub append_system_prompt: Option<String>,
    /// Maximum agentic turns before the CLI stops with `error_max_turns`.
    pub max_turns: Option<u32>,
    /// Thinking-token budget.
    pub max_thinking_tokens: Option<u32>,
    /// Spend ceiling in USD.
    pub max_budget_usd: Option<f64>,
    pub permission_mode: Option<PermissionMode>,
    /// Tool names auto-approved without prompting. Tool-argument
    /// sub-patterns (`"Bash(git:*)"`) pass through untouched.
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub tools: Option<ToolsConfig>,
    /// Additional directories the CLI may touch (`--add-dir`).
    pub add_dir: Option<Vec<PathBuf>>,
    /// Path to (or inline JSON of) an MCP config file. Mutually exclusive
    /// with `mcp_servers`.
    pub mcp_config: Option<String>,
    pub mcp_servers: Option<HashMap<String, McpServerConfig>>,
    /// Name of an MCP tool the CLI should use for permission prompts.
    /// Mutually exclusive with `can_use_tool`.
    pub permission_prompt_tool: Option<String>,
    /// Permission callback gating every tool execution. Its presence makes
    /// the command builder request stdio permission prompts.
    pub can_use_tool: Option<Arc<dyn HookCallback>>,
    pub hooks: Option<HashMap<HookEvent, Vec<HookMatcher>>>,
    /// Accepted for completeness; the subprocess is always driven in
    /// bidirectional stream-json mode, so anything else fails validation.
    pub output_format: Option<String>,
    /// Path to (or inline JSON of) a settings file.
    pub settings: Option<String>,
    pub setting_sources: Option<Vec<String>>,
    /// Agent definitions, carried in the initialize handshake.
    pub agents: Option<HashMap<String, serde_json::Value>>,
    pub plugins: Option<Vec<serde_json::Value>>,
    pub include_partial_messages: Option<bool>,
    /// Session id to resume.
    pub resume: Option<String>,
    pub fork_session: Option<bool>,
    /// Continue the most recent conversation (`--continue`).
    pub continue_conversation: Option<bool>,
    pub sandbox: Option<bool>,
    /// Beta feature names, exported as `ANTHROPIC_BETAS`.
    pub betas: Option<Vec<String>>,
    /// Extra environment variables for the child.
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<PathBuf>,
    pub cli_path: Option<CliPath>,
    /// Raw flags appended verbatim after everything derived.
    pub extra_args: Option<Vec<String>>,
    /// Let the child's stderr through to the parent's instead of
    /// discarding it. Useful when debugging the CLI itself.
    pub include_stderr: Option<bool>,
    pub max_buffer_size: Option<usize>,
    /// Overall query deadline.
    pub timeout: Option<Duration>,
    /// Observational callback fired for every ToolUse block.
    pub tool_callback: Option<Arc<dyn ToolCallback>>,
    /// Label used in tracing spans for this session.
    pub name: Option<String>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("model", &self.model)
            .field("permission_mode", &self.permission_mode)
            .field("allowed_tools", &self.allowed_tools)
            .field("max_turns", &self.max_turns)
            .field("resume", &self.resume)
            .field("cwd", &self.cwd)
            .field("cli_path", &self.cli_path)
            .field("has_api_key", &self.api_key.is_some())
            .field("has_can_use_tool", &self.can_use_tool.is_some())
            .field("has_hooks", &self.hooks.is_some())
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Options {
    /// Effective line cap for the stdout accumulator.
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size.unwrap_or(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Effective per-query deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_QUERY_TIMEOUT)
    }

    /// Effective binary resolution mode.
    pub fn cli_path(&self) -> CliPath {
        self.cli_path.clone().unwrap_or_default()
    }

    /// Layer `tiers` left to right, later tiers overriding earlier ones.
    /// Field-valued options overlay field-wise; collection-valued options
    /// (lists, mappings) replace wholesale rather than merging entries.
    pub fn resolve(tiers: &[&Options]) -> Options {
        let mut out = Options::default();
        for tier in tiers {
            out.apply(tier);
        }
        out
    }

    fn apply(&mut self, over: &Options) {
        macro_rules! overlay {
            ($($field:ident),+ $(,)?) => {
                $(if over.$field.is_some() {
                    self.$field = over.$field.clone();
                })+
            };
        }
        overlay!(
            api_key,
            model,
            fallback_model,
            system_prompt,
            append_system_prompt,
            max_turns,
            max_thinking_tokens,
            max_budget_usd,
            permission_mode,
            allowed_tools,
            disallowed_tools,
            tools,
            add_dir,
            mcp_config,
            mcp_servers,
            permission_prompt_tool,
            can_use_tool,
            hooks,
            output_format,
            settings,
            setting_sources,
            agents,
            plugins,
            include_partial_messages,
            resume,
            fork_session,
            continue_conversation,
            sandbox,
            betas,
            env,
            cwd,
            cli_path,
            extra_args,
            include_stderr,
            max_buffer_size,
            timeout,
            tool_callback,
            name,
        );
    }

    /// Check the merged option set once, before it is used.
    ///
    /// Failures name the offending option so callers can report precisely.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_none() && std::env::var("ANTHROPIC_API_KEY").is_err() {
            return Err(DriverError::Config {
                option: "api_key",
                reason: "not set and ANTHROPIC_API_KEY is absent from the environment".into(),
            });
        }
        if self.can_use_tool.is_some() && self.permission_prompt_tool.is_some() {
            return Err(DriverError::Config {
                option: "permission_prompt_tool",
                reason: "mutually exclusive with can_use_tool".into(),
            });
        }
        if self.mcp_config.is_some() && self.mcp_servers.is_some() {
            return Err(DriverError::Config {
                option: "mcp_config",
                reason: "mutually exclusive with mcp_servers".into(),
            });
        }
        if let Some(format) = &self.output_format {
            if format != "stream-json" {
                return Err(DriverError::Config {
                    option: "output_format",
                    reason: format!(
                        "the subprocess is driven in stream-json mode; got {format:?}"
                    ),
                });
            }
        }
        if self.max_buffer_size == Some(0) {
            return Err(DriverError::Config {
                option: "max_buffer_size",
                reason: "must be at least one byte".into(),
            });
        }
        if let Some(t) = self.timeout {
            if t.is_zero() {
                return Err(DriverError::Config {
                    option: "timeout",
                    reason: "must be non-zero".into(),
                });
            }
        }
        if let Some(budget) = self.max_budget_usd {
            if !budget.is_finite() || budget < 0.0 {
                return Err(DriverError::Config {
                    option: "max_budget_usd",
                    reason: format!("must be a non-negative number, got {budget}"),
                });
            }
        }
        Ok(())
    }

    /// In-process tool sets declared under `mcp_servers`.
    pub(crate) fn sdk_tool_sets(&self) -> Vec<ToolSet> {
        let Some(servers) = &self.mcp_servers else {
            return Vec::new();
        };
        servers
            .iter()
            .filter_map(|(name, cfg)| match cfg {
                McpServerConfig::Sdk(set) => {
                    let mut set = set.clone();
                    set.name = name.clone();
                    Some(set)
                }
                McpServerConfig::Stdio { .. } => None,
            })
            .collect()
    }

    /// Serializable projection sent to a remote sidecar, which rebuilds the
    /// CLI invocation on its side. Callbacks and local-only tuning knobs
    /// stay behind.
    pub(crate) fn remote_wire(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        macro_rules! put {
            ($key:literal, $value:expr) => {
                if let Some(v) = $value {
                    map.insert($key.into(), serde_json::json!(v));
                }
            };
        }
        put!("model", &self.model);
        put!("fallback_model", &self.fallback_model);
        put!("system_prompt", &self.system_prompt);
        put!("append_system_prompt", &self.append_system_prompt);
        put!("max_turns", self.max_turns);
        put!("max_thinking_tokens", self.max_thinking_tokens);
        put!("max_budget_usd", self.max_budget_usd);
        put!(
            "permission_mode",
            self.permission_mode.as_ref().map(PermissionMode::as_str)
        );
        put!("allowed_tools", &self.allowed_tools);
        put!("disallowed_tools", &self.disallowed_tools);
        put!("settings", &self.settings);
        put!("setting_sources", &self.setting_sources);
        put!("include_partial_messages", self.include_partial_messages);
        put!("fork_session", self.fork_session);
        put!("sandbox", self.sandbox);
        put!("betas", &self.betas);
        put!(
            "cwd",
            self.cwd.as_ref().map(|p| p.to_string_lossy().into_owned())
        );
        serde_json::Value::Object(map)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
