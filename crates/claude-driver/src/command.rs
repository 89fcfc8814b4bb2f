use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::options::{McpServerConfig, Options, ToolsConfig};

// ─── Argv construction ────────────────────────────────────────────────────

/// Translate a validated option set into CLI arguments.
///
/// Arguments are handed to `tokio::process::Command` directly, so no shell
/// quoting is involved. Options consumed at the protocol layer (`hooks`,
/// `agents`, `can_use_tool` content, `api_key`, buffer/timeout tuning)
/// produce no flags here; they ride the environment or the initialize
/// handshake instead.
pub fn build_argv(opts: &Options) -> Vec<String> {
    // Bidirectional stream-json is what the control protocol runs over;
    // queries go in on stdin and everything comes back on stdout.
    let mut args: Vec<String> = vec![
        "--input-format".into(),
        "stream-json".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];

    if let Some(model) = &opts.model {
        flag(&mut args, "--model", model.clone());
    }
    if let Some(fallback) = &opts.fallback_model {
        flag(&mut args, "--fallback-model", fallback.clone());
    }
    if let Some(prompt) = &opts.system_prompt {
        flag(&mut args, "--system-prompt", prompt.clone());
    }
    if let Some(append) = &opts.append_system_prompt {
        flag(&mut args, "--append-system-prompt", append.clone());
    }
    if let Some(n) = opts.max_turns {
        flag(&mut args, "--max-turns", n.to_string());
    }
    if let Some(n) = opts.max_thinking_tokens {
        flag(&mut args, "--max-thinking-tokens", n.to_string());
    }
    if let Some(budget) = opts.max_budget_usd {
        flag(&mut args, "--max-budget-usd", budget.to_string());
    }
    if let Some(mode) = &opts.permission_mode {
        flag(&mut args, "--permission-mode", mode.as_str().to_owned());
    }
    if let Some(tools) = &opts.allowed_tools {
        flag(&mut args, "--allowed-tools", tools.join(","));
    }
    if let Some(tools) = &opts.disallowed_tools {
        flag(&mut args, "--disallowed-tools", tools.join(","));
    }
    match &opts.tools {
        Some(ToolsConfig::Preset(preset)) => flag(&mut args, "--tools", preset.clone()),
        Some(ToolsConfig::List(list)) => flag(&mut args, "--tools", list.join(",")),
        None => {}
    }
    for dir in opts.add_dir.iter().flatten() {
        flag(&mut args, "--add-dir", dir.to_string_lossy().into_owned());
    }
    if let Some(config) = &opts.mcp_config {
        flag(&mut args, "--mcp-config", config.clone());
    }
    if let Some(servers) = &opts.mcp_servers {
        if !servers.is_empty() {
            flag(&mut args, "--mcp-config", mcp_config_json(servers));
        }
    }
    // A permission callback routes prompts back to us over stdio; a named
    // prompt tool delegates to that tool. Validation forbids having both.
    if opts.can_use_tool.is_some() {
        flag(&mut args, "--permission-prompt-tool", "stdio".to_owned());
    } else if let Some(tool) = &opts.permission_prompt_tool {
        flag(&mut args, "--permission-prompt-tool", tool.clone());
    }
    if let Some(settings) = &opts.settings {
        flag(&mut args, "--settings", settings.clone());
    }
    if let Some(sources) = &opts.setting_sources {
        flag(&mut args, "--setting-sources", sources.join(","));
    }
    if let Some(plugins) = &opts.plugins {
        if !plugins.is_empty() {
            flag(&mut args, "--plugins", Value::Array(plugins.clone()).to_string());
        }
    }
    if opts.include_partial_messages == Some(true) {
        args.push("--include-partial-messages".into());
    }
    if let Some(session_id) = &opts.resume {
        flag(&mut args, "--resume", session_id.clone());
    }
    if opts.fork_session == Some(true) {
        args.push("--fork-session".into());
    }
    if opts.continue_conversation == Some(true) {
        args.push("--continue".into());
    }
    if opts.sandbox == Some(true) {
        args.push("--sandbox".into());
    }
    if let Some(cwd) = &opts.cwd {
        flag(&mut args, "--cwd", cwd.to_string_lossy().into_owned());
    }
    if let Some(extra) = &opts.extra_args {
        args.extend(extra.iter().cloned());
    }

    args
}

fn flag(args: &mut Vec<String>, name: &str, value: String) {
    args.push(name.to_owned());
    args.push(value);
}

/// Serialize the `mcp_servers` mapping into the single JSON value the CLI
/// takes via `--mcp-config`.
///
/// In-process tool sets are emitted as `{"type":"sdk","name":...}` so the
/// CLI routes their traffic back through the control protocol instead of
/// spawning anything. Keys are sorted so the argv is stable for a given
/// option set.
pub fn mcp_config_json(servers: &std::collections::HashMap<String, McpServerConfig>) -> String {
    let sorted: BTreeMap<&String, &McpServerConfig> = servers.iter().collect();
    let mut mcp_servers = serde_json::Map::new();

    for (name, config) in sorted {
        let entry = match config {
            McpServerConfig::Stdio { command, args, env } => {
                let mut cfg = serde_json::Map::new();
                cfg.insert("type".into(), json!("stdio"));
                cfg.insert("command".into(), json!(command));
                if !args.is_empty() {
                    cfg.insert("args".into(), json!(args));
                }
                if !env.is_empty() {
                    let env: BTreeMap<_, _> = env.iter().collect();
                    cfg.insert("env".into(), json!(env));
                }
                Value::Object(cfg)
            }
            McpServerConfig::Sdk(_) => json!({"type": "sdk", "name": name}),
        };
        mcp_servers.insert(name.clone(), entry);
    }

    json!({ "mcpServers": mcp_servers }).to_string()
}

// ─── Stdin envelopes ──────────────────────────────────────────────────────

/// The user-turn envelope written to the CLI's stdin, one per query.
/// `session_id` is the captured conversation id when resuming.
pub fn user_envelope(prompt: &str, session_id: Option<&str>) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        },
        "parent_tool_use_id": Value::Null,
        "session_id": session_id,
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────
