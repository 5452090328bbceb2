//! Deterministic on-disk layout under `<root>/.ship/`.
//!
//! Every path the runtime reads or writes is derived here so the layout is
//! reproducible across restarts and processes:
//!
//! ```text
//! <root>/.ship/context/<urlencoded(contextId)>/messages/
//!     messages.jsonl
//!     meta.json
//!     .context.lock
//!     archive/<archiveId>.json
//! ```
//!
//! Task-run contexts (`task-run:<taskId>:<timestamp>`) use the alternate
//! `<root>/.ship/task/<taskId>/<timestamp>/messages/` layout; the store
//! accepts a pre-built [`ContextDirs`] so one engine writes either.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

const TASK_RUN_PREFIX: &str = "task-run:";
const MAX_TASK_ID_LEN: usize = 64;

/// Validate a context id at an API boundary: non-empty after trim.
///
/// Returns the trimmed id. Empty ids fail fast with `invalid_context_id`.
pub fn validate_context_id(context_id: &str) -> Result<&str> {
    let trimmed = context_id.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidContextId(
            "context id must be non-empty".into(),
        ));
    }
    Ok(trimmed)
}

/// `true` if `task_id` matches `[A-Za-z0-9][A-Za-z0-9_-]{0,63}`.
fn is_valid_task_id(task_id: &str) -> bool {
    let mut chars = task_id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    if task_id.len() > MAX_TASK_ID_LEN {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A context id of the form `task-run:<taskId>:<timestamp>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunId {
    pub task_id: String,
    pub timestamp: String,
}

impl TaskRunId {
    /// Parse a task-run context id. Returns `None` for ordinary context ids,
    /// `Err` for a malformed task-run id.
    pub fn parse(context_id: &str) -> Result<Option<TaskRunId>> {
        let Some(rest) = context_id.strip_prefix(TASK_RUN_PREFIX) else {
            return Ok(None);
        };
        let Some((task_id, timestamp)) = rest.split_once(':') else {
            return Err(CoreError::InvalidContextId(format!(
                "task-run id missing timestamp: {context_id}"
            )));
        };
        if !is_valid_task_id(task_id) {
            return Err(CoreError::InvalidContextId(format!(
                "invalid task id: {task_id}"
            )));
        }
        if timestamp.is_empty() {
            return Err(CoreError::InvalidContextId(format!(
                "task-run id missing timestamp: {context_id}"
            )));
        }
        Ok(Some(TaskRunId {
            task_id: task_id.to_string(),
            timestamp: timestamp.to_string(),
        }))
    }
}

// ---------------------------------------------------------------------------
// ContextDirs
// ---------------------------------------------------------------------------

/// Resolved directory set for one context's transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDirs {
    messages_dir: PathBuf,
}

impl ContextDirs {
    /// Build from an explicit messages directory (layout override).
    pub fn new(messages_dir: impl Into<PathBuf>) -> Self {
        Self {
            messages_dir: messages_dir.into(),
        }
    }

    pub fn messages_dir(&self) -> &Path {
        &self.messages_dir
    }

    pub fn messages_file(&self) -> PathBuf {
        self.messages_dir.join("messages.jsonl")
    }

    pub fn meta_file(&self) -> PathBuf {
        self.messages_dir.join("meta.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.messages_dir.join(".context.lock")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.messages_dir.join("archive")
    }

    pub fn archive_file(&self, archive_id: &str) -> PathBuf {
        self.archive_dir().join(format!("{archive_id}.json"))
    }
}

// ---------------------------------------------------------------------------
// ShipPaths
// ---------------------------------------------------------------------------

/// Root of the deterministic `.ship/` layout for one project.
#[derive(Debug, Clone)]
pub struct ShipPaths {
    root: PathBuf,
}

impl ShipPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ship_dir(&self) -> PathBuf {
        self.root.join(".ship")
    }

    /// `<root>/Agent.md` — the project's system-prompt component.
    pub fn agent_file(&self) -> PathBuf {
        self.root.join("Agent.md")
    }

    /// `<root>/ship.json` — the project configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("ship.json")
    }

    /// `.ship/profile/` — optional long-term memory files.
    pub fn profile_dir(&self) -> PathBuf {
        self.ship_dir().join("profile")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.ship_dir().join("skills")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.ship_dir().join("logs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.ship_dir().join("cache")
    }

    pub fn public_dir(&self) -> PathBuf {
        self.ship_dir().join("public")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.ship_dir().join("tasks")
    }

    /// `.ship/config/mcp.json` — external-tool connector configuration,
    /// read by the MCP integration layer.
    pub fn mcp_config_file(&self) -> PathBuf {
        self.ship_dir().join("config").join("mcp.json")
    }

    /// Resolve the transcript directories for `context_id`, selecting the
    /// task-run layout when the id encodes one.
    pub fn context_dirs(&self, context_id: &str) -> Result<ContextDirs> {
        let context_id = validate_context_id(context_id)?;
        if let Some(task_run) = TaskRunId::parse(context_id)? {
            return Ok(ContextDirs::new(
                self.ship_dir()
                    .join("task")
                    .join(&task_run.task_id)
                    .join(&task_run.timestamp)
                    .join("messages"),
            ));
        }
        let encoded = urlencoding::encode(context_id).into_owned();
        Ok(ContextDirs::new(
            self.ship_dir()
                .join("context")
                .join(encoded)
                .join("messages"),
        ))
    }

    /// Per-context memory file, read into the system prompt when present.
    pub fn context_memory_file(&self, context_id: &str) -> Result<PathBuf> {
        let dirs = self.context_dirs(context_id)?;
        // memory.md sits next to messages/, not inside it.
        Ok(dirs
            .messages_dir()
            .parent()
            .unwrap_or(dirs.messages_dir())
            .join("memory.md"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
