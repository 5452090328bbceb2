//! Model-provider interface.
//!
//! The runtime never talks HTTP itself — the provider SDK is an external
//! collaborator implementing [`ModelProvider`]. Requests carry messages in
//! the model-SDK block format (`text` / `tool_use` / `tool_result` content
//! blocks) that the store's `to_model_messages` produces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tool definition sent to the model API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool call extracted from a model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Request to a model provider.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    /// Messages in model-SDK format (role + content block array).
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: u32,
    /// Tools to expose. Empty slices omit tools entirely.
    pub tools: Vec<ToolDefinition>,
}

/// Non-streaming response from a model provider.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    /// Concatenated text content.
    pub content: String,
    pub model: String,
    /// `"tool_use"` when the model requested tool execution.
    pub stop_reason: String,
    pub tool_calls: Vec<ToolCall>,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Common interface for all model providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send a non-streaming request and wait for the full response.
    async fn send(&self, req: &ModelRequest) -> Result<ModelResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    fn message(&self) -> String {
        self.to_string()
    }
}

/// Markers that identify a context-window overflow in provider error text.
///
/// Overflow is the one provider error the runner retries (with halved
/// budgets) instead of surfacing to the user.
const OVERFLOW_MARKERS: &[&str] = &["context_length", "too long", "maximum context", "context window"];

/// Classify a provider error as a context-window overflow.
pub fn is_context_overflow(err: &ProviderError) -> bool {
    let message = err.message().to_lowercase();
    OVERFLOW_MARKERS.iter().any(|m| message.contains(m))
}
