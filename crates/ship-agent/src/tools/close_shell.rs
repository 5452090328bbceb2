//! `close_shell` tool — release a session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use ship_core::RequestContext;
use ship_shell::ShellManager;

use super::{Tool, ToolResult};

#[derive(Deserialize)]
struct CloseShellInput {
    context_id: u64,
    #[serde(default)]
    force: bool,
}

/// Tool that terminates a shell session and drops its buffered output.
/// Closing an unknown id is idempotent success.
pub struct CloseShellTool {
    shell: Arc<Mutex<ShellManager>>,
}

impl CloseShellTool {
    pub fn new(shell: Arc<Mutex<ShellManager>>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl Tool for CloseShellTool {
    fn name(&self) -> &str {
        "close_shell"
    }

    fn description(&self) -> &str {
        "Terminate a shell session (SIGTERM, or SIGKILL with force) and release its id. \
         Safe to call on an already-released session."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "context_id": {
                    "type": "integer",
                    "description": "Session id returned by exec_command."
                },
                "force": {
                    "type": "boolean",
                    "description": "Use SIGKILL instead of SIGTERM."
                }
            },
            "required": ["context_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &RequestContext) -> ToolResult {
        let input: CloseShellInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid close_shell input: {e}")),
        };

        match self
            .shell
            .lock()
            .await
            .close_shell(input.context_id, input.force)
            .await
        {
            Ok(()) => ToolResult::success(serde_json::json!({ "success": true })),
            Err(e) => ToolResult::error(format!("{} ({})", e, e.code())),
        }
    }
}
