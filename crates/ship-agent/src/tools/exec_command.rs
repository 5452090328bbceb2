//! `exec_command` tool — start a long-lived shell session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use ship_core::RequestContext;
use ship_shell::{ExecRequest, ShellManager};

use super::{Tool, ToolResult};

#[derive(Deserialize)]
struct ExecCommandInput {
    command: String,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default = "bool_true")]
    login: bool,
    #[serde(default = "default_yield")]
    yield_time_ms: u64,
    #[serde(default)]
    max_output_tokens: Option<u64>,
}

fn bool_true() -> bool {
    true
}

fn default_yield() -> u64 {
    ship_shell::types::DEFAULT_YIELD_MS
}

/// Tool that spawns a shell session and returns the first output page.
pub struct ExecCommandTool {
    shell: Arc<Mutex<ShellManager>>,
}

impl ExecCommandTool {
    pub fn new(shell: Arc<Mutex<ShellManager>>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl Tool for ExecCommandTool {
    fn name(&self) -> &str {
        "exec_command"
    }

    fn description(&self) -> &str {
        "Start a shell command in a long-lived session and return the first page of output. \
         If has_more_output is true, poll with write_stdin(context_id, chars=\"\") for the rest. \
         The session stays alive until the command exits and its output is drained, or until \
         close_shell is called."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command to run via `<shell> -lc`."
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory, relative to the project root."
                },
                "shell": {
                    "type": "string",
                    "description": "Shell binary. Defaults to $SHELL, then /bin/bash."
                },
                "login": {
                    "type": "boolean",
                    "description": "Spawn as a login shell (-lc). Default true."
                },
                "yield_time_ms": {
                    "type": "integer",
                    "description": "How long to wait for output before returning (50–30000 ms)."
                },
                "max_output_tokens": {
                    "type": "integer",
                    "description": "Tighten the page size to roughly this many tokens."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value, ctx: &RequestContext) -> ToolResult {
        let input: ExecCommandInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid exec_command input: {e}")),
        };
        if input.command.trim().is_empty() {
            return ToolResult::error("missing required parameter: command");
        }

        let req = ExecRequest {
            command: input.command,
            workdir: input.workdir,
            shell: input.shell,
            login: input.login,
            yield_time_ms: input.yield_time_ms,
            max_output_tokens: input.max_output_tokens,
        };

        match self.shell.lock().await.exec_command(req, ctx).await {
            Ok(page) => ToolResult::success(page),
            Err(e) => ToolResult::error(format!("{} ({})", e, e.code())),
        }
    }
}
