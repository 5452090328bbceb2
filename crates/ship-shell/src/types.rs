//! Shared data types and limits for the shell-session subsystem.

use serde::{Deserialize, Serialize};

/// Hard cap on concurrently tracked sessions.
pub const MAX_ACTIVE_SHELL_CONTEXTS: usize = 64;

/// Pending-output cap per session; overflow drops the oldest chars.
pub const MAX_CONTEXT_PENDING_CHARS: usize = 1_000_000;

/// Lower clamp for `yield_time_ms`.
pub const MIN_YIELD_MS: u64 = 50;

/// Upper clamp for `yield_time_ms`.
pub const MAX_YIELD_MS: u64 = 30_000;

/// Minimum wait for an empty-input `write_stdin` poll.
pub const EMPTY_POLL_MIN_MS: u64 = 5_000;

/// Brief extra wait for a follow-on chunk once bytes are already pending.
pub const FOLLOW_ON_WAIT_MS: u64 = 30;

/// Exited-and-drained sessions older than this are swept opportunistically.
pub const CLEANUP_QUIET_SECS: u64 = 60;

/// Default `yield_time_ms` when the tool call does not supply one.
pub const DEFAULT_YIELD_MS: u64 = 10_000;

// ---------------------------------------------------------------------------
// ExecRequest
// ---------------------------------------------------------------------------

/// Parameters of an `exec_command` tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    /// Working directory, resolved relative to the project root.
    #[serde(default)]
    pub workdir: Option<String>,
    /// Shell binary; defaults to `$SHELL`, then `/bin/bash`.
    #[serde(default)]
    pub shell: Option<String>,
    /// Spawn with `-lc` (login) rather than `-c`.
    #[serde(default = "bool_true")]
    pub login: bool,
    /// How long to wait for output before returning, clamped to
    /// [[`MIN_YIELD_MS`], [`MAX_YIELD_MS`]].
    #[serde(default = "default_yield_ms")]
    pub yield_time_ms: u64,
    /// Tightens the page character budget to `4 ×` this value.
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

fn bool_true() -> bool {
    true
}

fn default_yield_ms() -> u64 {
    DEFAULT_YIELD_MS
}

// ---------------------------------------------------------------------------
// PageBudget
// ---------------------------------------------------------------------------

/// Output budgets for one returned page.
#[derive(Debug, Clone, Copy)]
pub struct PageBudget {
    pub max_chars: usize,
    pub max_lines: usize,
}

impl PageBudget {
    /// Tighten the character budget by a per-call token cap (4 chars per
    /// token).
    pub fn with_max_output_tokens(self, max_output_tokens: Option<u64>) -> Self {
        match max_output_tokens {
            Some(tokens) => Self {
                max_chars: self.max_chars.min((tokens as usize).saturating_mul(4)),
                max_lines: self.max_lines,
            },
            None => self,
        }
    }
}

// ---------------------------------------------------------------------------
// OutputPage
// ---------------------------------------------------------------------------

/// One paged response from `exec_command` or `write_stdin`.
///
/// `context_id` is `null` exactly when the session was finalized by this
/// call (exited with the buffer fully drained) — the id is gone and further
/// polls would fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPage {
    pub context_id: Option<u64>,
    pub output: String,
    pub has_more_output: bool,
    pub exited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Total chars discarded by buffer overflow so far.
    pub dropped_chars: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// ShellSessionInfo
// ---------------------------------------------------------------------------

/// Metadata snapshot of one tracked session.
#[derive(Debug, Clone, Serialize)]
pub struct ShellSessionInfo {
    pub id: u64,
    pub command: String,
    pub shell: String,
    pub cwd: String,
    pub exited: bool,
    pub pending_chars: usize,
    pub dropped_chars: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_cap_tightens_char_budget() {
        let budget = PageBudget {
            max_chars: 12_000,
            max_lines: 200,
        };
        assert_eq!(budget.with_max_output_tokens(Some(200)).max_chars, 800);
        assert_eq!(budget.with_max_output_tokens(Some(100_000)).max_chars, 12_000);
        assert_eq!(budget.with_max_output_tokens(None).max_chars, 12_000);
    }
}
