//! `write_stdin` tool — stream input into a session / poll its output.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use ship_core::RequestContext;
use ship_shell::ShellManager;

use super::{Tool, ToolResult};

#[derive(Deserialize)]
struct WriteStdinInput {
    context_id: u64,
    #[serde(default)]
    chars: String,
    #[serde(default = "default_yield")]
    yield_time_ms: u64,
    #[serde(default)]
    max_output_tokens: Option<u64>,
}

fn default_yield() -> u64 {
    ship_shell::types::DEFAULT_YIELD_MS
}

/// Tool that writes to a session's stdin and returns the next output page.
pub struct WriteStdinTool {
    shell: Arc<Mutex<ShellManager>>,
}

impl WriteStdinTool {
    pub fn new(shell: Arc<Mutex<ShellManager>>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl Tool for WriteStdinTool {
    fn name(&self) -> &str {
        "write_stdin"
    }

    fn description(&self) -> &str {
        "Send characters to a running shell session's stdin and return the next page of \
         output. Call with empty chars to just poll for more output; a response with \
         context_id null means the session has finished and been released."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "context_id": {
                    "type": "integer",
                    "description": "Session id returned by exec_command."
                },
                "chars": {
                    "type": "string",
                    "description": "Characters to write. Empty polls for output only."
                },
                "yield_time_ms": {
                    "type": "integer",
                    "description": "How long to wait for output before returning."
                },
                "max_output_tokens": {
                    "type": "integer",
                    "description": "Tighten the page size to roughly this many tokens."
                }
            },
            "required": ["context_id"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _ctx: &RequestContext) -> ToolResult {
        let input: WriteStdinInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolResult::error(format!("invalid write_stdin input: {e}")),
        };

        match self
            .shell
            .lock()
            .await
            .write_stdin(
                input.context_id,
                &input.chars,
                input.yield_time_ms,
                input.max_output_tokens,
            )
            .await
        {
            Ok(page) => ToolResult::success(page),
            Err(e) => ToolResult::error(format!("{} ({})", e, e.code())),
        }
    }
}
