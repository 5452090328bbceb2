//! Scripted mock provider for tests.
//!
//! Each [`MockTurn`] answers one `send` call in order. Requests are recorded
//! so tests can assert on what the runner actually sent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::provider::{ModelProvider, ModelRequest, ModelResponse, ProviderError, ToolCall};

/// One scripted provider reply.
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Final text answer (`stop_reason = "end_turn"`).
    Text(String),
    /// A single tool call (`stop_reason = "tool_use"`), optionally preceded
    /// by visible text.
    ToolUse {
        text: String,
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// A provider error with the given message (classified by its content,
    /// e.g. include `context_length_exceeded` to trigger the overflow path).
    Error(String),
}

/// Scripted, request-recording [`ModelProvider`].
pub struct MockProvider {
    script: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
    /// Per-call artificial latency, for concurrency-observing tests.
    delay: Option<Duration>,
}

impl MockProvider {
    pub fn new(turns: impl IntoIterator<Item = MockTurn>) -> Self {
        Self {
            script: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Push another turn onto the end of the script.
    pub fn push(&self, turn: MockTurn) {
        self.script.lock().unwrap().push_back(turn);
    }

    /// Number of `send` calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Snapshot of every recorded request.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, req: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let turn = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Unavailable("mock script exhausted".into()))?;

        let response = match turn {
            MockTurn::Text(content) => ModelResponse {
                content,
                model: req.model.clone(),
                stop_reason: "end_turn".into(),
                tool_calls: Vec::new(),
                tokens_in: 10,
                tokens_out: 10,
            },
            MockTurn::ToolUse { text, id, name, input } => ModelResponse {
                content: text,
                model: req.model.clone(),
                stop_reason: "tool_use".into(),
                tool_calls: vec![ToolCall { id, name, input }],
                tokens_in: 10,
                tokens_out: 10,
            },
            MockTurn::Error(message) => {
                return Err(ProviderError::Api { status: 400, message });
            }
        };
        Ok(response)
    }
}
