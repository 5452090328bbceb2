//! Tool system for model tool calling.
//!
//! Defines the `Tool` trait all tools implement, the application-supplied
//! base [`ToolSet`], and the per-run [`executor::ToolExecutor`] that layers
//! skill gating and the post-tool lane-drain hook on top. Tools never see
//! that wrapping.

pub mod close_shell;
pub mod exec_command;
pub mod executor;
pub mod write_stdin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use ship_core::RequestContext;

use crate::provider::ToolDefinition;

/// Result of executing a tool: a JSON value handed back to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub output: serde_json::Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: impl Serialize) -> Self {
        Self {
            output: serde_json::to_value(output).unwrap_or(serde_json::Value::Null),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: serde_json::json!({ "success": false, "error": message.into() }),
            is_error: true,
        }
    }

    /// `true` when the output is a JSON object carrying `success: false`.
    pub fn reports_failure(&self) -> bool {
        self.is_error
            || self
                .output
                .get("success")
                .and_then(|v| v.as_bool())
                .is_some_and(|success| !success)
    }
}

/// Trait that all tools implement.
///
/// The request context is passed explicitly so deeply-nested tool code can
/// read request-scoped fields without any ambient global.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, e.g. `"exec_command"`.
    fn name(&self) -> &str;
    /// Human-readable description shown to the model.
    fn description(&self) -> &str;
    /// JSON Schema for the input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with the given input.
    async fn execute(&self, input: serde_json::Value, ctx: &RequestContext) -> ToolResult;
}

/// The application-supplied base tool map for a runtime.
#[derive(Default)]
pub struct ToolSet {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// API-level definitions for every registered tool, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_failure_detection() {
        assert!(ToolResult::error("boom").reports_failure());
        assert!(!ToolResult::success(serde_json::json!({"output": "ok"})).reports_failure());
        assert!(ToolResult {
            output: serde_json::json!({"success": false, "detail": "sad"}),
            is_error: false,
        }
        .reports_failure());
        assert!(!ToolResult {
            output: serde_json::json!({"success": true}),
            is_error: false,
        }
        .reports_failure());
    }
}
