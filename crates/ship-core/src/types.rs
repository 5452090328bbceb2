//! Persisted data model: one record type per JSON shape written to disk.
//!
//! The transcript is an append-only JSONL file of [`TurnMessage`] records;
//! [`ContextMeta`] lives next to it as `meta.json`. Field names on the wire
//! are fixed — changing a rename here breaks every transcript already on
//! disk.

use serde::{Deserialize, Serialize};

/// Current schema version stamped into every turn and meta record.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Roles / provenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Which side of the pipeline wrote the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Written when a platform message was ingested.
    Ingress,
    /// Written when the agent produced output.
    Egress,
    /// Synthesized by compaction.
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Normal,
    /// A compaction summary standing in for an archived segment.
    Summary,
}

// ---------------------------------------------------------------------------
// Parts
// ---------------------------------------------------------------------------

/// One ordered content part of a turn.
///
/// User turns carry text parts only; assistant turns may additionally carry
/// the tool calls the model issued and the outputs those calls produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolOutput {
        id: String,
        name: String,
        output: serde_json::Value,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// The text content if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Turn metadata
// ---------------------------------------------------------------------------

/// Range of archived turns a summary turn stands in for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRange {
    pub from_id: String,
    pub to_id: String,
    pub count: usize,
}

/// Control metadata stamped onto every persisted turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    /// Schema version — always [`SCHEMA_VERSION`].
    pub v: u32,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub context_id: String,
    pub channel: String,
    pub target_id: String,
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    /// Platform-level message id, when the adapter supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    pub source: Source,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_range: Option<SourceRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Turn message
// ---------------------------------------------------------------------------

/// One immutable transcript record. Appended once, never mutated; compaction
/// may move a turn verbatim into an archive segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMessage {
    /// Unique within the context. User turns derive a deterministic id from
    /// the platform message id when one was supplied.
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub metadata: TurnMetadata,
}

impl TurnMessage {
    /// Concatenated text content of all text parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Context meta
// ---------------------------------------------------------------------------

/// Per-context control record, persisted as `meta.json` next to the
/// transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMeta {
    pub v: u32,
    pub context_id: String,
    /// Milliseconds since the Unix epoch of the last meta write.
    pub updated_at: i64,
    /// Skill ids auto-loaded for every subsequent run on this context.
    #[serde(default)]
    pub pinned_skill_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_archive_id: Option<String>,
    /// Thresholds applied by the last compaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last_messages: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens_approx: Option<usize>,
}

impl ContextMeta {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            context_id: context_id.into(),
            updated_at: chrono::Utc::now().timestamp_millis(),
            pinned_skill_ids: Vec::new(),
            last_archive_id: None,
            keep_last_messages: None,
            max_input_tokens_approx: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// A platform message handed to `ContextManager::enqueue` by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub context_id: String,
    pub channel: String,
    pub target_id: String,
    pub actor_id: String,
    #[serde(default)]
    pub actor_name: Option<String>,
    /// Platform-level message id. Supplying one makes ingest idempotent.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<i64>,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
