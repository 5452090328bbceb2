//! Project configuration: `ship.json` plus `SHIP_*` environment overrides.
//!
//! Field names on disk are camelCase to match the persisted config format.
//! Every numeric knob has a floor or clamp applied by the `effective_*`
//! accessors, never at parse time, so a config file round-trips unchanged.

use std::path::Path;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_KEEP_LAST_MESSAGES: usize = 30;
pub const MIN_KEEP_LAST_MESSAGES: usize = 6;
pub const DEFAULT_MAX_INPUT_TOKENS_APPROX: usize = 12_000;
pub const MIN_MAX_INPUT_TOKENS_APPROX: usize = 2_000;
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY_LIMIT: usize = 32;
pub const DEFAULT_CORRECTION_MAX_ROUNDS: usize = 2;
pub const CORRECTION_MAX_ROUNDS_LIMIT: usize = 10;
pub const DEFAULT_CORRECTION_MAX_MERGED: usize = 5;
pub const CORRECTION_MAX_MERGED_LIMIT: usize = 50;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 12_000;
pub const MIN_MAX_OUTPUT_CHARS: usize = 500;
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 200;
pub const MIN_MAX_OUTPUT_LINES: usize = 20;

/// Top-level config (`ship.json` + `SHIP_*` env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipConfig {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

impl ShipConfig {
    /// Load from `<root>/ship.json` (when present) with `SHIP_*` overrides.
    ///
    /// Env keys use `__` as the nesting separator, e.g.
    /// `SHIP_CONTEXT__CHATQUEUE__MAXCONCURRENCY=4`.
    pub fn load(root: &Path) -> Result<Self> {
        let mut figment = Figment::new();
        let file = root.join("ship.json");
        if file.is_file() {
            figment = figment.merge(Json::file(file));
        }
        figment
            .merge(Env::prefixed("SHIP_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default, rename = "chatQueue")]
    pub chat_queue: ChatQueueConfig,
}

/// Transcript retention / compaction thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(default = "default_keep_last_messages")]
    pub keep_last_messages: usize,
    #[serde(default = "default_max_input_tokens_approx")]
    pub max_input_tokens_approx: usize,
    #[serde(default = "bool_true")]
    pub archive_on_compact: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            keep_last_messages: DEFAULT_KEEP_LAST_MESSAGES,
            max_input_tokens_approx: DEFAULT_MAX_INPUT_TOKENS_APPROX,
            archive_on_compact: true,
        }
    }
}

impl HistoryConfig {
    /// `keepLastMessages` with the hard floor applied.
    pub fn effective_keep_last_messages(&self) -> usize {
        self.keep_last_messages.max(MIN_KEEP_LAST_MESSAGES)
    }

    /// `maxInputTokensApprox` with the hard floor applied.
    pub fn effective_max_input_tokens(&self) -> usize {
        self.max_input_tokens_approx.max(MIN_MAX_INPUT_TOKENS_APPROX)
    }
}

/// Lane scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQueueConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "bool_true")]
    pub enable_correction_merge: bool,
    #[serde(default = "default_correction_max_rounds")]
    pub correction_max_rounds: usize,
    #[serde(default = "default_correction_max_merged")]
    pub correction_max_merged_messages: usize,
}

impl Default for ChatQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            enable_correction_merge: true,
            correction_max_rounds: DEFAULT_CORRECTION_MAX_ROUNDS,
            correction_max_merged_messages: DEFAULT_CORRECTION_MAX_MERGED,
        }
    }
}

impl ChatQueueConfig {
    /// `maxConcurrency` clamped to `[1, 32]`.
    pub fn effective_max_concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT)
    }

    pub fn effective_correction_max_rounds(&self) -> usize {
        self.correction_max_rounds.min(CORRECTION_MAX_ROUNDS_LIMIT)
    }

    pub fn effective_correction_max_merged(&self) -> usize {
        self.correction_max_merged_messages
            .min(CORRECTION_MAX_MERGED_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default, rename = "exec_command")]
    pub exec_command: ExecCommandPermissions,
}

/// Output budgets for the shell-session tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommandPermissions {
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,
}

impl Default for ExecCommandPermissions {
    fn default() -> Self {
        Self {
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
        }
    }
}

impl ExecCommandPermissions {
    pub fn effective_max_output_chars(&self) -> usize {
        self.max_output_chars.max(MIN_MAX_OUTPUT_CHARS)
    }

    pub fn effective_max_output_lines(&self) -> usize {
        self.max_output_lines.max(MIN_MAX_OUTPUT_LINES)
    }
}

fn bool_true() -> bool {
    true
}
fn default_keep_last_messages() -> usize {
    DEFAULT_KEEP_LAST_MESSAGES
}
fn default_max_input_tokens_approx() -> usize {
    DEFAULT_MAX_INPUT_TOKENS_APPROX
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_correction_max_rounds() -> usize {
    DEFAULT_CORRECTION_MAX_ROUNDS
}
fn default_correction_max_merged() -> usize {
    DEFAULT_CORRECTION_MAX_MERGED
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_max_output_lines() -> usize {
    DEFAULT_MAX_OUTPUT_LINES
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
