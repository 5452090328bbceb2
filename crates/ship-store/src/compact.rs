//! Two-phase transcript compaction.
//!
//! Phases: *snapshot* (short lock) → *decide* and *summarize* (no lock, the
//! model call may be slow) → *commit* (short lock, re-split against the
//! current transcript so concurrent appends are preserved). The older
//! segment is archived verbatim, the transcript is rewritten atomically as
//! one summary turn followed by the kept tail, and meta records the applied
//! thresholds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use ship_core::types::{Kind, Part, Role, Source, SourceRange, TurnMessage, TurnMetadata};

use crate::error::Result;
use crate::lock::ContextLock;
use crate::store::ContextStore;

/// Linearized-transcript cap handed to the summarizer.
const LINEARIZE_MAX_CHARS: usize = 24_000;

/// Substitute summary used when the model call fails. Compaction never
/// aborts the pipeline over a summarizer error.
const FALLBACK_SUMMARY: &str = "Earlier conversation history was compacted, but the summary \
     could not be generated. The archived turns are no longer visible; treat prior details \
     as potentially missing and re-ask the user when something matters.";

/// Produces a Markdown summary of a linearized transcript segment.
///
/// Implemented by the agent runner over its model provider; the store has
/// no model dependency of its own.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> std::result::Result<String, String>;
}

/// Thresholds for one compaction attempt.
#[derive(Debug, Clone)]
pub struct CompactParams {
    /// Turns preserved verbatim at the tail.
    pub keep_last_messages: usize,
    /// Approximate input-token budget; estimate = ⌈chars / 3⌉.
    pub max_input_tokens_approx: usize,
    /// Write the older segment to `archive/<archiveId>.json` before rewrite.
    pub archive_on_compact: bool,
    /// Serialized system-prompt size, counted into the budget estimate.
    pub system_prompt_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Transcript has ≤ keepLastMessages + 2 turns.
    SmallMessages,
    /// Estimated tokens fit the budget.
    UnderBudget,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SmallMessages => "small_messages",
            SkipReason::UnderBudget => "under_budget",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompactOutcome {
    Skipped(SkipReason),
    Compacted {
        /// Present when `archive_on_compact` was set.
        archive_id: Option<String>,
        /// Turns moved out of the active transcript.
        archived: usize,
        /// Turns preserved after the summary.
        kept: usize,
        /// The fallback notice was used instead of a model summary.
        lossy: bool,
    },
}

impl CompactOutcome {
    pub fn compacted(&self) -> bool {
        matches!(self, CompactOutcome::Compacted { .. })
    }
}

/// Archive segment file: the older turns verbatim plus enough header to
/// identify the segment without parsing the turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSegment {
    pub archive_id: String,
    pub context_id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub from_id: String,
    pub to_id: String,
    pub count: usize,
    pub turns: Vec<TurnMessage>,
}

pub(crate) async fn run(
    store: &ContextStore,
    params: &CompactParams,
    summarizer: &dyn Summarizer,
) -> Result<CompactOutcome> {
    // Phase 1 — snapshot (short lock).
    let snapshot = {
        let lock = ContextLock::acquire(&store.lock_path()).await?;
        let turns = store.load_all();
        lock.release();
        turns?
    };

    // Phase 2 — decide (no lock).
    let keep = params.keep_last_messages;
    if snapshot.len() <= keep + 2 {
        return Ok(CompactOutcome::Skipped(SkipReason::SmallMessages));
    }
    let total_chars: usize = params.system_prompt_chars
        + snapshot
            .iter()
            .map(|t| serde_json::to_string(t).map(|s| s.len()).unwrap_or(0))
            .sum::<usize>();
    let estimated_tokens = total_chars.div_ceil(3);
    if estimated_tokens <= params.max_input_tokens_approx {
        return Ok(CompactOutcome::Skipped(SkipReason::UnderBudget));
    }

    let split = snapshot.len() - keep;
    let older = &snapshot[..split];

    // Phase 3 — summarize (no lock, potentially long).
    let linearized = linearize(older);
    let (summary, lossy) = match summarizer.summarize(&linearized).await {
        Ok(text) if !text.trim().is_empty() => (text, false),
        Ok(_) => {
            warn!(context = %store.context_id(), "compaction_summary_failed: empty summary");
            (FALLBACK_SUMMARY.to_string(), true)
        }
        Err(e) => {
            warn!(context = %store.context_id(), error = %e, "compaction_summary_failed");
            (FALLBACK_SUMMARY.to_string(), true)
        }
    };

    // Phase 4 — commit (short lock). The transcript may have grown while we
    // summarized; re-split against its current length.
    let lock = ContextLock::acquire(&store.lock_path()).await?;
    let result = commit(store, params, summary, lossy).await;
    lock.release();
    result
}

async fn commit(
    store: &ContextStore,
    params: &CompactParams,
    summary: String,
    lossy: bool,
) -> Result<CompactOutcome> {
    let current = store.load_all()?;
    let keep = params.keep_last_messages;
    if current.len() <= keep {
        // Shrunk out from under us; nothing safe to archive.
        return Ok(CompactOutcome::Skipped(SkipReason::SmallMessages));
    }
    let split = current.len() - keep;
    let older = &current[..split];
    let kept = &current[split..];

    let from_id = older.first().map(|t| t.id.clone()).unwrap_or_default();
    let to_id = older.last().map(|t| t.id.clone()).unwrap_or_default();
    let now_ms = chrono::Utc::now().timestamp_millis();

    let archive_id = if params.archive_on_compact {
        let archive_id = format!("{}-{}", now_ms, uuid::Uuid::new_v4().simple());
        let segment = ArchiveSegment {
            archive_id: archive_id.clone(),
            context_id: store.context_id().to_string(),
            created_at: now_ms,
            from_id: from_id.clone(),
            to_id: to_id.clone(),
            count: older.len(),
            turns: older.to_vec(),
        };
        store.ensure_archive_dir()?;
        std::fs::write(
            store.archive_path(&archive_id),
            serde_json::to_string(&segment)?,
        )?;
        Some(archive_id)
    } else {
        None
    };

    // Channel/target carry over from the newest turn so the summary stays
    // addressable within the same conversation.
    let reference = current.last().expect("non-empty transcript");
    let summary_turn = TurnMessage {
        id: format!("s:{}:{}", store.context_id(), now_ms),
        role: Role::Assistant,
        parts: vec![Part::text(summary)],
        metadata: TurnMetadata {
            v: ship_core::types::SCHEMA_VERSION,
            ts: now_ms,
            context_id: store.context_id().to_string(),
            channel: reference.metadata.channel.clone(),
            target_id: reference.metadata.target_id.clone(),
            actor_id: "bot".to_string(),
            actor_name: None,
            message_id: None,
            thread_id: None,
            source: Source::Compact,
            kind: Kind::Summary,
            source_range: Some(SourceRange {
                from_id,
                to_id,
                count: older.len(),
            }),
            request_id: None,
        },
    };

    let mut rewritten = Vec::with_capacity(kept.len() + 1);
    rewritten.push(summary_turn);
    rewritten.extend_from_slice(kept);
    store.write_transcript_locked(&rewritten)?;

    let mut meta = store.load_meta()?;
    meta.updated_at = now_ms;
    meta.last_archive_id = archive_id.clone().or(meta.last_archive_id);
    meta.keep_last_messages = Some(keep);
    meta.max_input_tokens_approx = Some(params.max_input_tokens_approx);
    store.write_meta_locked(&meta)?;

    info!(
        context = %store.context_id(),
        archived = older.len(),
        kept = kept.len(),
        lossy,
        "transcript compacted"
    );

    Ok(CompactOutcome::Compacted {
        archive_id,
        archived: older.len(),
        kept: kept.len(),
        lossy,
    })
}

/// Linearize turns as `role: text` lines for the summarizer, truncating to
/// [`LINEARIZE_MAX_CHARS`] while preserving the tail (the most recent turns
/// matter most to the summary).
fn linearize(turns: &[TurnMessage]) -> String {
    let mut lines = String::new();
    for turn in turns {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let text = turn.text();
        if text.is_empty() {
            continue;
        }
        lines.push_str(role);
        lines.push_str(": ");
        lines.push_str(&text);
        lines.push('\n');
    }
    if lines.chars().count() <= LINEARIZE_MAX_CHARS {
        return lines;
    }
    let tail: String = lines
        .chars()
        .rev()
        .take(LINEARIZE_MAX_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("[earlier turns truncated]\n{tail}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ship_core::paths::ContextDirs;

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _transcript: &str) -> std::result::Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _transcript: &str) -> std::result::Result<String, String> {
            Err("provider unavailable".into())
        }
    }

    fn params(keep: usize, budget: usize) -> CompactParams {
        CompactParams {
            keep_last_messages: keep,
            max_input_tokens_approx: budget,
            archive_on_compact: true,
            system_prompt_chars: 0,
        }
    }

    async fn seed(store: &ContextStore, n: usize, chars: usize) {
        let body = "x".repeat(chars);
        for i in 0..n {
            let (id, role) = if i % 2 == 0 {
                (format!("u:{i}"), Role::User)
            } else {
                (format!("a:{i}"), Role::Assistant)
            };
            store
                .append(&crate::store::test_turn(&id, role, &body))
                .await
                .unwrap();
        }
    }

    fn store(dir: &std::path::Path) -> ContextStore {
        ContextStore::with_dirs("ctx-a", ContextDirs::new(dir.join("messages"))).unwrap()
    }

    #[tokio::test]
    async fn small_transcript_is_skipped_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 7, 200).await;

        let outcome = store
            .compact_if_needed(&params(6, 10), &FixedSummarizer("s"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompactOutcome::Skipped(SkipReason::SmallMessages)
        ));
        assert_eq!(store.load_all().unwrap().len(), 7);
        assert!(!store.dirs().archive_dir().exists());
    }

    #[tokio::test]
    async fn under_budget_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 20, 10).await;

        let outcome = store
            .compact_if_needed(&params(6, 1_000_000), &FixedSummarizer("s"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompactOutcome::Skipped(SkipReason::UnderBudget)
        ));
        assert_eq!(store.load_all().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn compaction_round_trips_through_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        // 50 alternating turns, ~200 chars each, keep 6, budget 2000.
        seed(&store, 50, 200).await;
        let before = store.load_all().unwrap();

        let outcome = store
            .compact_if_needed(&params(6, 2_000), &FixedSummarizer("## Summary\nearlier chat"))
            .await
            .unwrap();
        let CompactOutcome::Compacted {
            archive_id: Some(archive_id),
            archived,
            kept,
            lossy,
        } = outcome
        else {
            panic!("expected compaction");
        };
        assert_eq!(archived, 44);
        assert_eq!(kept, 6);
        assert!(!lossy);

        let after = store.load_all().unwrap();
        assert_eq!(after.len(), 7);
        let summary = &after[0];
        assert_eq!(summary.metadata.kind, Kind::Summary);
        assert_eq!(summary.metadata.source, Source::Compact);
        let range = summary.metadata.source_range.as_ref().unwrap();
        assert_eq!(range.count, 44);
        assert_eq!(range.from_id, "u:0");
        assert_eq!(range.to_id, "a:43");

        // Archive + post-compaction tail (minus summary) == pre-compaction
        // transcript, turn for turn.
        let raw = std::fs::read_to_string(store.dirs().archive_file(&archive_id)).unwrap();
        let segment: ArchiveSegment = serde_json::from_str(&raw).unwrap();
        let mut reconstructed = segment.turns.clone();
        reconstructed.extend_from_slice(&after[1..]);
        assert_eq!(reconstructed, before);

        // Meta records the applied thresholds.
        let meta = store.load_meta().unwrap();
        assert_eq!(meta.last_archive_id.as_deref(), Some(archive_id.as_str()));
        assert_eq!(meta.keep_last_messages, Some(6));
        assert_eq!(meta.max_input_tokens_approx, Some(2_000));
    }

    #[tokio::test]
    async fn summarizer_failure_degrades_to_lossy_notice() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 30, 300).await;

        let outcome = store
            .compact_if_needed(&params(6, 2_000), &FailingSummarizer)
            .await
            .unwrap();
        let CompactOutcome::Compacted { lossy, .. } = outcome else {
            panic!("expected compaction");
        };
        assert!(lossy);

        let after = store.load_all().unwrap();
        assert!(after[0].text().contains("could not be generated"));
    }

    #[tokio::test]
    async fn archive_disabled_still_compacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 30, 300).await;

        let mut p = params(6, 2_000);
        p.archive_on_compact = false;
        let outcome = store
            .compact_if_needed(&p, &FixedSummarizer("s"))
            .await
            .unwrap();
        let CompactOutcome::Compacted { archive_id, .. } = outcome else {
            panic!("expected compaction");
        };
        assert!(archive_id.is_none());
        assert!(!store.dirs().archive_dir().exists());
        assert_eq!(store.load_all().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn concurrent_append_during_summarize_is_preserved() {
        use std::sync::Arc;
        use ship_core::paths::ContextDirs;

        // A summarizer that appends a turn mid-summarize, simulating a
        // message arriving while the (unlocked) model call is in flight.
        struct AppendingSummarizer {
            store: Arc<ContextStore>,
        }

        #[async_trait]
        impl Summarizer for AppendingSummarizer {
            async fn summarize(&self, _transcript: &str) -> std::result::Result<String, String> {
                self.store
                    .append(&crate::store::test_turn("u:late", Role::User, "late arrival"))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok("summary".into())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ContextStore::with_dirs("ctx-a", ContextDirs::new(dir.path().join("messages")))
                .unwrap(),
        );
        seed(&store, 30, 300).await;

        let summarizer = AppendingSummarizer {
            store: Arc::clone(&store),
        };
        let outcome = store
            .compact_if_needed(&params(6, 2_000), &summarizer)
            .await
            .unwrap();

        // The commit re-splits against the grown transcript: 31 turns, keep
        // 6, so 25 are archived and the late arrival survives in the tail.
        let CompactOutcome::Compacted { archived, kept, .. } = outcome else {
            panic!("expected compaction");
        };
        assert_eq!(archived, 25);
        assert_eq!(kept, 6);
        let after = store.load_all().unwrap();
        assert!(after.iter().any(|t| t.id == "u:late"));
        assert_eq!(after[0].metadata.kind, Kind::Summary);
    }

    #[test]
    fn linearize_preserves_tail_when_over_cap() {
        let turns: Vec<TurnMessage> = (0..300)
            .map(|i| {
                crate::store::test_turn(
                    &format!("u:{i}"),
                    Role::User,
                    &format!("message number {i} {}", "pad".repeat(40)),
                )
            })
            .collect();
        let out = linearize(&turns);
        assert!(out.chars().count() <= LINEARIZE_MAX_CHARS + 30);
        assert!(out.starts_with("[earlier turns truncated]"));
        assert!(out.contains("message number 299"));
        assert!(!out.contains("message number 0 "));
    }
}
