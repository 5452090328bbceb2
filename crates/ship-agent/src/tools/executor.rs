//! Per-run tool execution wrapper.
//!
//! Interposes two hooks around the base tool set:
//!
//! 1. **Active-skill gating** — when skills restrict tools, only the union
//!    of their allowlists (plus the shell triad) is visible or executable.
//! 2. **Post-tool lane drain** — after every execution the scheduler's
//!    `drain_lane_merged` callback runs, so newly-arrived messages on the
//!    same lane fold into the ongoing loop instead of queueing behind it.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use ship_core::RequestContext;

use crate::provider::{ToolCall, ToolDefinition};
use crate::runner::{DrainFn, DrainOutcome};
use crate::tools::{ToolResult, ToolSet};

/// Per-run view of the tool set with gating and the drain hook applied.
pub struct ToolExecutor {
    tools: Arc<ToolSet>,
    /// `None` = all tools available (no skill restriction in effect).
    allowed: Option<HashSet<String>>,
    drain: Option<DrainFn>,
}

impl ToolExecutor {
    pub fn new(tools: Arc<ToolSet>, allowed: Option<HashSet<String>>, drain: Option<DrainFn>) -> Self {
        Self { tools, allowed, drain }
    }

    fn is_allowed(&self, name: &str) -> bool {
        match &self.allowed {
            Some(set) => set.contains(name),
            None => true,
        }
    }

    /// Definitions exposed to the model this run, after gating.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .definitions()
            .into_iter()
            .filter(|d| self.is_allowed(&d.name))
            .collect()
    }

    /// Names of the tools effective this run, sorted.
    pub fn effective_names(&self) -> Vec<String> {
        self.definitions().into_iter().map(|d| d.name).collect()
    }

    /// Execute one tool call, then run the post-tool drain hook.
    ///
    /// Unknown or gated tools produce an error result, never a panic or an
    /// aborted loop.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &RequestContext,
    ) -> (ToolResult, DrainOutcome) {
        let result = match self.tools.get(&call.name) {
            _ if !self.is_allowed(&call.name) => ToolResult::error(format!(
                "tool `{}` is not permitted by the active skills",
                call.name
            )),
            Some(tool) => {
                debug!(tool = %call.name, "executing tool");
                tool.execute(call.input.clone(), ctx).await
            }
            None => ToolResult::error(format!("unknown tool: {}", call.name)),
        };

        let drained = match &self.drain {
            Some(drain) => drain().await,
            None => DrainOutcome::default(),
        };

        (result, drained)
    }
}
