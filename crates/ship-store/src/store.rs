//! Append-only JSONL transcript store for one context.
//!
//! Readers may race writers: appends are whole-line writes under the context
//! lock and the parser skips anything malformed, so a torn read degrades to
//! a skipped line, never a failed load.

use std::io::Write;

use tracing::{debug, warn};

use ship_core::paths::{ContextDirs, ShipPaths};
use ship_core::types::{ContextMeta, Part, Role, TurnMessage};

use crate::compact::{self, CompactOutcome, CompactParams, Summarizer};
use crate::error::Result;
use crate::lock::ContextLock;

/// Per-context transcript store.
///
/// One instance per context; cheap to clone paths from, all state is on
/// disk. Mutating operations take the context lock; loads do not.
pub struct ContextStore {
    context_id: String,
    dirs: ContextDirs,
}

impl ContextStore {
    /// Open (creating directories as needed) the store for `context_id`
    /// under the standard layout.
    pub fn open(paths: &ShipPaths, context_id: &str) -> Result<Self> {
        let context_id = ship_core::paths::validate_context_id(context_id)?.to_string();
        let dirs = paths.context_dirs(&context_id)?;
        std::fs::create_dir_all(dirs.messages_dir())?;
        Ok(Self { context_id, dirs })
    }

    /// Open with an explicit directory override (task-run layout or tests).
    pub fn with_dirs(context_id: &str, dirs: ContextDirs) -> Result<Self> {
        let context_id = ship_core::paths::validate_context_id(context_id)?.to_string();
        std::fs::create_dir_all(dirs.messages_dir())?;
        Ok(Self { context_id, dirs })
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn dirs(&self) -> &ContextDirs {
        &self.dirs
    }

    // -----------------------------------------------------------------------
    // Append / load
    // -----------------------------------------------------------------------

    /// Append one turn as a single JSON line, holding the context lock for
    /// the duration of the write (compaction rewrites the same file).
    pub async fn append(&self, turn: &TurnMessage) -> Result<()> {
        let line = serde_json::to_string(turn)?;
        let lock = ContextLock::acquire(&self.dirs.lock_file()).await?;
        let result = (|| -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dirs.messages_file())?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        })();
        lock.release();
        debug!(context = %self.context_id, turn = %turn.id, "turn appended");
        result
    }

    /// Load the full transcript, skipping malformed lines.
    pub fn load_all(&self) -> Result<Vec<TurnMessage>> {
        let path = self.dirs.messages_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(parse_transcript(&raw, &self.context_id))
    }

    /// Load turns in index range `[from, to)`, clamped to the transcript.
    pub fn load_range(&self, from: usize, to: usize) -> Result<Vec<TurnMessage>> {
        let turns = self.load_all()?;
        let from = from.min(turns.len());
        let to = to.clamp(from, turns.len());
        Ok(turns[from..to].to_vec())
    }

    // -----------------------------------------------------------------------
    // Meta
    // -----------------------------------------------------------------------

    /// Load `meta.json`, falling back to a fresh record when absent or
    /// unreadable.
    pub fn load_meta(&self) -> Result<ContextMeta> {
        let path = self.dirs.meta_file();
        if !path.exists() {
            return Ok(ContextMeta::new(&self.context_id));
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(meta),
            Err(e) => {
                warn!(context = %self.context_id, error = %e, "meta.json unreadable, resetting");
                Ok(ContextMeta::new(&self.context_id))
            }
        }
    }

    /// Apply `mutate` to the meta record under the context lock and persist
    /// it atomically. Returns the updated record.
    pub async fn update_meta(
        &self,
        mutate: impl FnOnce(&mut ContextMeta),
    ) -> Result<ContextMeta> {
        let lock = ContextLock::acquire(&self.dirs.lock_file()).await?;
        let result = (|| -> Result<ContextMeta> {
            let mut meta = self.load_meta()?;
            mutate(&mut meta);
            meta.updated_at = chrono::Utc::now().timestamp_millis();
            self.write_meta_locked(&meta)?;
            Ok(meta)
        })();
        lock.release();
        result
    }

    /// Pin one skill id (idempotent).
    pub async fn add_pinned_skill_id(&self, skill_id: &str) -> Result<ContextMeta> {
        let skill_id = skill_id.to_string();
        self.update_meta(move |meta| {
            if !meta.pinned_skill_ids.contains(&skill_id) {
                meta.pinned_skill_ids.push(skill_id);
            }
        })
        .await
    }

    /// Replace the pinned-skill set wholesale.
    pub async fn set_pinned_skill_ids(&self, skill_ids: Vec<String>) -> Result<ContextMeta> {
        self.update_meta(move |meta| {
            meta.pinned_skill_ids = skill_ids;
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    /// Compact the transcript if it exceeds the configured budgets.
    /// See [`crate::compact`] for the two-phase algorithm.
    pub async fn compact_if_needed(
        &self,
        params: &CompactParams,
        summarizer: &dyn Summarizer,
    ) -> Result<CompactOutcome> {
        compact::run(self, params, summarizer).await
    }

    // -----------------------------------------------------------------------
    // Model conversion
    // -----------------------------------------------------------------------

    /// Convert transcript turns into model-SDK messages.
    ///
    /// Turn ids are stripped. With `with_tools`, assistant tool calls become
    /// `tool_use` blocks and their outputs `tool_result` blocks in an
    /// interleaved user message; a call whose output never arrived (or an
    /// orphan output) is dropped rather than producing an unpaired block.
    pub fn to_model_messages(turns: &[TurnMessage], with_tools: bool) -> Vec<serde_json::Value> {
        let mut messages = Vec::new();

        for turn in turns {
            match turn.role {
                Role::User => {
                    let text = turn.text();
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": [{ "type": "text", "text": text }],
                    }));
                }
                Role::Assistant => {
                    if with_tools {
                        append_assistant_with_tools(&mut messages, turn);
                    } else {
                        let text = turn.text();
                        if !text.is_empty() {
                            messages.push(serde_json::json!({
                                "role": "assistant",
                                "content": [{ "type": "text", "text": text }],
                            }));
                        }
                    }
                }
            }
        }

        messages
    }

    // -----------------------------------------------------------------------
    // Internal helpers (shared with compaction)
    // -----------------------------------------------------------------------

    /// Atomically replace the transcript (write-tmp + rename). Caller must
    /// hold the context lock.
    pub(crate) fn write_transcript_locked(&self, turns: &[TurnMessage]) -> Result<()> {
        let mut body = String::new();
        for turn in turns {
            body.push_str(&serde_json::to_string(turn)?);
            body.push('\n');
        }
        let target = self.dirs.messages_file();
        let tmp = target.with_extension("jsonl.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Atomically persist meta. Caller must hold the context lock.
    pub(crate) fn write_meta_locked(&self, meta: &ContextMeta) -> Result<()> {
        let target = self.dirs.meta_file();
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(meta)?)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub(crate) fn lock_path(&self) -> std::path::PathBuf {
        self.dirs.lock_file()
    }

    pub(crate) fn archive_path(&self, archive_id: &str) -> std::path::PathBuf {
        self.dirs.archive_file(archive_id)
    }

    pub(crate) fn ensure_archive_dir(&self) -> Result<()> {
        std::fs::create_dir_all(self.dirs.archive_dir())?;
        Ok(())
    }
}

/// Parse a transcript body line-by-line, skipping malformed entries.
fn parse_transcript(raw: &str, context_id: &str) -> Vec<TurnMessage> {
    let mut turns = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<TurnMessage>(trimmed) {
            Ok(turn) => turns.push(turn),
            Err(e) => {
                warn!(
                    context = %context_id,
                    line = idx + 1,
                    error = %e,
                    "store_parse_skipped: malformed transcript line"
                );
            }
        }
    }
    turns
}

/// Expand one assistant turn into assistant/user message pairs carrying
/// `tool_use` and `tool_result` blocks.
fn append_assistant_with_tools(messages: &mut Vec<serde_json::Value>, turn: &TurnMessage) {
    use std::collections::HashSet;

    // Ids present on both sides; anything unpaired is dropped.
    let call_ids: HashSet<&str> = turn
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolCall { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    let output_ids: HashSet<&str> = turn
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolOutput { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();

    let mut assistant_blocks: Vec<serde_json::Value> = Vec::new();
    let mut result_blocks: Vec<serde_json::Value> = Vec::new();

    let flush =
        |messages: &mut Vec<serde_json::Value>,
         assistant_blocks: &mut Vec<serde_json::Value>,
         result_blocks: &mut Vec<serde_json::Value>| {
            if !assistant_blocks.is_empty() {
                messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": std::mem::take(assistant_blocks),
                }));
            }
            if !result_blocks.is_empty() {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": std::mem::take(result_blocks),
                }));
            }
        };

    for part in &turn.parts {
        match part {
            Part::Text { text } => {
                if !result_blocks.is_empty() {
                    flush(messages, &mut assistant_blocks, &mut result_blocks);
                }
                assistant_blocks.push(serde_json::json!({ "type": "text", "text": text }));
            }
            Part::ToolCall { id, name, input } => {
                if !output_ids.contains(id.as_str()) {
                    debug!(call = %id, "dropping tool call with no recorded output");
                    continue;
                }
                if !result_blocks.is_empty() {
                    flush(messages, &mut assistant_blocks, &mut result_blocks);
                }
                assistant_blocks.push(serde_json::json!({
                    "type": "tool_use", "id": id, "name": name, "input": input,
                }));
            }
            Part::ToolOutput { id, output, .. } => {
                if !call_ids.contains(id.as_str()) {
                    debug!(call = %id, "dropping tool output with no recorded call");
                    continue;
                }
                // Results belong to the *preceding* assistant blocks.
                if !assistant_blocks.is_empty() {
                    messages.push(serde_json::json!({
                        "role": "assistant",
                        "content": std::mem::take(&mut assistant_blocks),
                    }));
                }
                result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": output.to_string(),
                }));
            }
        }
    }
    flush(messages, &mut assistant_blocks, &mut result_blocks);
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

/// Minimal turn fixture shared by the store and compaction tests.
#[cfg(test)]
pub(crate) fn test_turn(id: &str, role: Role, text: &str) -> TurnMessage {
    use ship_core::types::{Kind, Source, TurnMetadata};
    TurnMessage {
        id: id.to_string(),
        role,
        parts: vec![Part::text(text)],
        metadata: TurnMetadata {
            v: 1,
            ts: chrono::Utc::now().timestamp_millis(),
            context_id: "ctx-a".into(),
            channel: "test".into(),
            target_id: "t".into(),
            actor_id: "u".into(),
            actor_name: None,
            message_id: None,
            thread_id: None,
            source: if matches!(role, Role::User) {
                Source::Ingress
            } else {
                Source::Egress
            },
            kind: Kind::Normal,
            source_range: None,
            request_id: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn test_store(dir: &Path) -> ContextStore {
        ContextStore::with_dirs("ctx-a", ContextDirs::new(dir.join("messages"))).unwrap()
    }

    fn turn(id: &str, role: Role, text: &str) -> TurnMessage {
        test_turn(id, role, text)
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        store.append(&turn("u:1", Role::User, "ping")).await.unwrap();
        store
            .append(&turn("a:1", Role::Assistant, "pong"))
            .await
            .unwrap();

        let turns = store.load_all().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, "u:1");
        assert_eq!(turns[1].text(), "pong");
        // Lock must be gone after each append.
        assert!(!store.lock_path().exists());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.append(&turn("u:1", Role::User, "ok")).await.unwrap();

        // Corrupt the file by hand: garbage, truncated JSON, wrong role.
        let path = store.dirs().messages_file();
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("not json at all\n");
        raw.push_str("{\"id\":\"x\",\"role\":\"user\"\n");
        raw.push_str("{\"id\":\"y\",\"role\":\"tool\",\"parts\":[],\"metadata\":{}}\n");
        std::fs::write(&path, raw).unwrap();
        store.append(&turn("u:2", Role::User, "still ok")).await.unwrap();

        let turns = store.load_all().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].id, "u:2");
    }

    #[tokio::test]
    async fn load_range_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        for i in 0..5 {
            store
                .append(&turn(&format!("u:{i}"), Role::User, "x"))
                .await
                .unwrap();
        }
        assert_eq!(store.load_range(1, 3).unwrap().len(), 2);
        assert_eq!(store.load_range(4, 100).unwrap().len(), 1);
        assert_eq!(store.load_range(100, 200).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn meta_updates_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());

        assert!(store.load_meta().unwrap().pinned_skill_ids.is_empty());
        store.add_pinned_skill_id("git-flow").await.unwrap();
        store.add_pinned_skill_id("git-flow").await.unwrap();
        store.add_pinned_skill_id("deploy").await.unwrap();

        let meta = store.load_meta().unwrap();
        assert_eq!(meta.pinned_skill_ids, vec!["git-flow", "deploy"]);
        assert_eq!(meta.context_id, "ctx-a");

        store
            .set_pinned_skill_ids(vec!["deploy".into()])
            .await
            .unwrap();
        assert_eq!(store.load_meta().unwrap().pinned_skill_ids, vec!["deploy"]);
    }

    #[test]
    fn empty_context_id_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = ContextStore::with_dirs("  ", ContextDirs::new(dir.path().join("m")))
            .err()
            .unwrap();
        assert_eq!(err.code(), "invalid_context_id");
    }

    #[test]
    fn model_messages_strip_ids_and_pair_tools() {
        let mut assistant = turn("a:1", Role::Assistant, "let me check");
        assistant.parts.push(Part::ToolCall {
            id: "t1".into(),
            name: "exec_command".into(),
            input: serde_json::json!({"command": "ls"}),
        });
        assistant.parts.push(Part::ToolOutput {
            id: "t1".into(),
            name: "exec_command".into(),
            output: serde_json::json!({"output": "README.md"}),
        });
        assistant.parts.push(Part::text("done"));
        let turns = vec![turn("u:1", Role::User, "list files"), assistant];

        let msgs = ContextStore::to_model_messages(&turns, true);
        // user, assistant(text+tool_use), user(tool_result), assistant(text)
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[1]["content"][1]["type"], "tool_use");
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[3]["content"][0]["text"], "done");
        assert!(msgs[1].get("id").is_none());
    }

    #[test]
    fn unpaired_tool_call_does_not_crash_conversion() {
        let mut assistant = turn("a:1", Role::Assistant, "checking");
        assistant.parts.push(Part::ToolCall {
            id: "t-lost".into(),
            name: "exec_command".into(),
            input: serde_json::json!({"command": "ls"}),
        });
        let turns = vec![assistant];

        let msgs = ContextStore::to_model_messages(&turns, true);
        assert_eq!(msgs.len(), 1);
        let content = msgs[0]["content"].as_array().unwrap();
        assert!(content.iter().all(|b| b["type"] == "text"));
    }

    #[test]
    fn without_tools_only_text_survives() {
        let mut assistant = turn("a:1", Role::Assistant, "hello");
        assistant.parts.push(Part::ToolCall {
            id: "t1".into(),
            name: "exec_command".into(),
            input: serde_json::json!({}),
        });
        let msgs = ContextStore::to_model_messages(&[assistant], false);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["content"][0]["text"], "hello");
    }
}
