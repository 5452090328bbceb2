//! Per-context tool-loop runner.
//!
//! One runner is bound to exactly one context. A run loads the transcript,
//! compacts it when over budget, drives the model/tool loop up to the step
//! cap, and returns the synthesized assistant turn — the scheduler appends
//! it after delivery, never the runner, so a retried slice cannot
//! double-write.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::{info, warn};

use ship_core::config::{MIN_KEEP_LAST_MESSAGES, MIN_MAX_INPUT_TOKENS_APPROX};
use ship_core::types::{InboundMessage, Kind, Part, Role, Source, TurnMessage, TurnMetadata};
use ship_core::{RequestContext, ShipConfig, ShipPaths};
use ship_store::{CompactParams, ContextStore, Summarizer};

use crate::error::{AgentError, Result};
use crate::prompt;
use crate::provider::{is_context_overflow, ModelProvider, ModelRequest, ProviderError};
use crate::skills::{self, SkillRegistry};
use crate::tools::executor::ToolExecutor;
use crate::tools::ToolSet;

/// Step cap per slice; bounds any single run.
pub const MAX_STEPS: usize = 30;

/// Context-overflow retries, each with halved budgets.
const MAX_OVERFLOW_ATTEMPTS: usize = 3;

/// Per-tool error summaries are clipped to this many chars.
const TOOL_ERROR_SUMMARY_MAX: usize = 200;

/// Transcript turns shown to the skill-drop prompt.
const SKILL_DROP_TAIL_TURNS: usize = 10;

// ---------------------------------------------------------------------------
// Run interface
// ---------------------------------------------------------------------------

/// Result of draining the lane at a tool boundary.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub drained: usize,
    pub messages: Vec<InboundMessage>,
}

/// Scheduler-supplied callback that folds queued lane messages into the
/// current slice.
pub type DrainFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = DrainOutcome> + Send>> + Send + Sync>;

/// Step-boundary events surfaced to the host.
#[derive(Debug, Clone)]
pub enum StepEvent {
    /// Assistant-visible text, emitted at most once per step.
    AssistantText(String),
    StepFinish { step: usize },
}

pub type OnStepFn = Arc<dyn Fn(StepEvent) + Send + Sync>;

/// One slice of work for the runner.
pub struct RunRequest {
    pub context: RequestContext,
    pub query: String,
    pub drain_lane_merged: Option<DrainFn>,
    pub on_step: Option<OnStepFn>,
}

/// Outcome of a slice.
pub struct RunOutcome {
    pub success: bool,
    /// Always non-empty, even on failure.
    pub output: String,
    /// Names of the tools called, in call order.
    pub tool_calls: Vec<String>,
    /// The synthesized assistant turn; appended by the scheduler after
    /// delivery. `None` on failure.
    pub assistant_message: Option<TurnMessage>,
}

/// Static settings for a runner instance.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub model: String,
    pub max_tokens: u32,
    pub keep_last_messages: usize,
    pub max_input_tokens_approx: usize,
    pub archive_on_compact: bool,
}

impl RunnerSettings {
    pub fn from_config(config: &ShipConfig, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4096,
            keep_last_messages: config.context.history.effective_keep_last_messages(),
            max_input_tokens_approx: config.context.history.effective_max_input_tokens(),
            archive_on_compact: config.context.history.archive_on_compact,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

pub struct AgentRunner {
    store: Arc<ContextStore>,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolSet>,
    skills: Arc<SkillRegistry>,
    paths: ShipPaths,
    settings: RunnerSettings,
    system_texts: Vec<String>,
    bound_context: StdMutex<Option<String>>,
    pinned_cache: tokio::sync::Mutex<Option<Vec<String>>>,
}

enum LoopError {
    Overflow(ProviderError),
    Provider(ProviderError),
    Store(ship_store::StoreError),
}

impl AgentRunner {
    pub fn new(
        store: Arc<ContextStore>,
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolSet>,
        skills: Arc<SkillRegistry>,
        paths: ShipPaths,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            provider,
            tools,
            skills,
            paths,
            settings,
            system_texts: Vec::new(),
            bound_context: StdMutex::new(None),
            pinned_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Application-supplied system prompt texts, appended after the project
    /// files.
    pub fn with_system_texts(mut self, texts: Vec<String>) -> Self {
        self.system_texts = texts;
        self
    }

    /// Run one slice. Binds the runner to the request's context on first
    /// use; later calls with a different context fail fast.
    pub async fn run(&self, req: RunRequest) -> Result<RunOutcome> {
        let context_id =
            ship_core::paths::validate_context_id(&req.context.context_id)?.to_string();
        {
            let mut bound = self.bound_context.lock().unwrap();
            match bound.as_deref() {
                Some(b) if b != context_id => {
                    return Err(AgentError::ContextMismatch {
                        bound: b.to_string(),
                        got: context_id,
                    });
                }
                Some(_) => {}
                None => *bound = Some(context_id.clone()),
            }
        }

        let mut request_ctx = req.context.clone();
        self.ensure_user_turn(&req.query, &request_ctx).await?;

        for attempt in 0..MAX_OVERFLOW_ATTEMPTS {
            let divisor = 1usize << attempt;
            let keep = (self.settings.keep_last_messages / divisor).max(MIN_KEEP_LAST_MESSAGES);
            let budget = (self.settings.max_input_tokens_approx / divisor)
                .max(MIN_MAX_INPUT_TOKENS_APPROX);

            let mut pinned = self.pinned_skill_ids().await?;
            let system = self.compose_system(&request_ctx, &pinned, req.drain_lane_merged.clone());

            let params = CompactParams {
                keep_last_messages: keep,
                max_input_tokens_approx: budget,
                archive_on_compact: self.settings.archive_on_compact,
                system_prompt_chars: system.len(),
            };
            let summarizer = ProviderSummarizer {
                provider: Arc::clone(&self.provider),
                model: self.settings.model.clone(),
            };
            let outcome = self.store.compact_if_needed(&params, &summarizer).await?;
            if outcome.compacted() && !pinned.is_empty() {
                pinned = self.drop_stale_skills(pinned).await;
            }

            // Rebuild the prompt and gating after a potential skill drop.
            let loaded = self.skills.resolve(&pinned);
            let allowed = skills::effective_allowlist(&loaded);
            let executor = ToolExecutor::new(
                Arc::clone(&self.tools),
                allowed,
                req.drain_lane_merged.clone(),
            );
            let skills_block = (!loaded.is_empty())
                .then(|| skills::active_skills_block(&loaded, &executor.effective_names()));
            let system = prompt::compose(
                &self.paths,
                &request_ctx,
                &self.system_texts,
                skills_block.as_deref(),
            );

            match self
                .tool_loop(&mut request_ctx, &req, &system, &executor)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(LoopError::Overflow(e)) if attempt + 1 < MAX_OVERFLOW_ATTEMPTS => {
                    warn!(
                        context = %context_id,
                        attempt = attempt + 1,
                        error = %e,
                        "context overflow, retrying with halved budgets"
                    );
                    continue;
                }
                Err(LoopError::Overflow(e)) | Err(LoopError::Provider(e)) => {
                    return Ok(RunOutcome {
                        success: false,
                        output: format!("Execution failed: {e}"),
                        tool_calls: Vec::new(),
                        assistant_message: None,
                    });
                }
                Err(LoopError::Store(e)) => return Err(e.into()),
            }
        }
        unreachable!("overflow retry loop always returns")
    }

    // -----------------------------------------------------------------------
    // User-turn idempotence
    // -----------------------------------------------------------------------

    /// Insert the user turn for this request unless the transcript already
    /// carries it (matched by platform message id, or by the normalized
    /// text of the most recent turn).
    async fn ensure_user_turn(&self, query: &str, ctx: &RequestContext) -> Result<()> {
        let turns = self.store.load_all()?;

        let id = match &ctx.message_id {
            Some(mid) => {
                let id = format!("u:{}:{}", ctx.context_id, mid);
                if turns.iter().any(|t| t.id == id) {
                    return Ok(());
                }
                id
            }
            None => {
                if let Some(last) = turns.last() {
                    if last.role == Role::User && last.text().trim() == query.trim() {
                        return Ok(());
                    }
                }
                format!(
                    "u:{}:{}",
                    ctx.context_id,
                    chrono::Utc::now().timestamp_millis()
                )
            }
        };

        let turn = TurnMessage {
            id,
            role: Role::User,
            parts: vec![Part::text(query)],
            metadata: TurnMetadata {
                v: ship_core::types::SCHEMA_VERSION,
                ts: chrono::Utc::now().timestamp_millis(),
                context_id: ctx.context_id.clone(),
                channel: ctx.channel.clone(),
                target_id: ctx.target_id.clone(),
                actor_id: ctx.actor_id.clone(),
                actor_name: ctx.actor_name.clone(),
                message_id: ctx.message_id.clone(),
                thread_id: ctx.thread_id,
                source: Source::Ingress,
                kind: Kind::Normal,
                source_range: None,
                request_id: Some(ctx.request_id.clone()),
            },
        };
        self.store.append(&turn).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pinned skills
    // -----------------------------------------------------------------------

    async fn pinned_skill_ids(&self) -> Result<Vec<String>> {
        let mut cache = self.pinned_cache.lock().await;
        if let Some(ids) = cache.as_ref() {
            return Ok(ids.clone());
        }
        let ids = self.store.load_meta()?.pinned_skill_ids;
        *cache = Some(ids.clone());
        Ok(ids)
    }

    /// After a compaction, ask the model which pinned skills no longer
    /// matter to the recent tail and unpin them. Any failure keeps the full
    /// set.
    async fn drop_stale_skills(&self, pinned: Vec<String>) -> Vec<String> {
        let tail_text = match self.store.load_all() {
            Ok(turns) => {
                let start = turns.len().saturating_sub(SKILL_DROP_TAIL_TURNS);
                turns[start..]
                    .iter()
                    .map(|t| {
                        let role = match t.role {
                            Role::User => "user",
                            Role::Assistant => "assistant",
                        };
                        format!("{role}: {}", t.text())
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Err(_) => return pinned,
        };

        let request = ModelRequest {
            model: self.settings.model.clone(),
            system: concat!(
                "You maintain the list of skills pinned to a conversation. ",
                "Given the pinned skill ids and the recent conversation tail, decide which ",
                "skills are no longer relevant and can be unloaded. ",
                "Respond with ONLY a JSON array of skill id strings to drop. ",
                "Return [] if every skill is still relevant."
            )
            .to_string(),
            messages: vec![serde_json::json!({
                "role": "user",
                "content": [{
                    "type": "text",
                    "text": format!("Pinned skills: {pinned:?}\n\nRecent tail:\n{tail_text}"),
                }],
            })],
            max_tokens: 256,
            tools: Vec::new(),
        };

        let response = match self.provider.send(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "skill-drop prompt failed, keeping all pinned skills");
                return pinned;
            }
        };

        // The array may be wrapped in prose or a code fence.
        let raw = response.content.trim();
        let json_str = match (raw.find('['), raw.rfind(']')) {
            (Some(s), Some(e)) if e >= s => &raw[s..=e],
            _ => raw,
        };
        let drop: Vec<String> = match serde_json::from_str(json_str) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, raw = %json_str, "skill-drop response unparsable");
                return pinned;
            }
        };
        if drop.is_empty() {
            return pinned;
        }

        let remaining: Vec<String> = pinned
            .iter()
            .filter(|id| !drop.contains(id))
            .cloned()
            .collect();
        if remaining.len() == pinned.len() {
            return pinned;
        }

        info!(dropped = ?drop, "unpinning skills after compaction");
        if let Err(e) = self.store.set_pinned_skill_ids(remaining.clone()).await {
            warn!(error = %e, "failed to persist pinned-skill drop");
            return pinned;
        }
        *self.pinned_cache.lock().await = Some(remaining.clone());
        remaining
    }

    fn compose_system(
        &self,
        ctx: &RequestContext,
        pinned: &[String],
        drain: Option<DrainFn>,
    ) -> String {
        let loaded = self.skills.resolve(pinned);
        let allowed = skills::effective_allowlist(&loaded);
        let executor = ToolExecutor::new(Arc::clone(&self.tools), allowed, drain);
        let block = (!loaded.is_empty())
            .then(|| skills::active_skills_block(&loaded, &executor.effective_names()));
        prompt::compose(&self.paths, ctx, &self.system_texts, block.as_deref())
    }

    // -----------------------------------------------------------------------
    // Tool loop
    // -----------------------------------------------------------------------

    async fn tool_loop(
        &self,
        request_ctx: &mut RequestContext,
        req: &RunRequest,
        system: &str,
        executor: &ToolExecutor,
    ) -> std::result::Result<RunOutcome, LoopError> {
        let mut prefix = ContextStore::to_model_messages(
            &self.store.load_all().map_err(LoopError::Store)?,
            true,
        );
        // In-flight assistant / tool-result messages produced this run; kept
        // across prefix reloads so merged messages never clobber the loop.
        let mut suffix: Vec<serde_json::Value> = Vec::new();
        let mut run_parts: Vec<Part> = Vec::new();
        let mut tool_names: Vec<String> = Vec::new();
        let mut tool_errors: Vec<(String, String)> = Vec::new();
        let mut final_text = String::new();
        let mut reload_prefix = false;

        for step in 0..MAX_STEPS {
            if reload_prefix {
                prefix = ContextStore::to_model_messages(
                    &self.store.load_all().map_err(LoopError::Store)?,
                    true,
                );
                reload_prefix = false;
            }

            let mut messages = prefix.clone();
            messages.extend(suffix.iter().cloned());
            let request = ModelRequest {
                model: self.settings.model.clone(),
                system: system.to_string(),
                messages,
                max_tokens: self.settings.max_tokens,
                tools: executor.definitions(),
            };

            let response = self.provider.send(&request).await.map_err(|e| {
                if is_context_overflow(&e) {
                    LoopError::Overflow(e)
                } else {
                    LoopError::Provider(e)
                }
            })?;

            if !response.content.is_empty() {
                final_text = response.content.clone();
                run_parts.push(Part::text(&response.content));
                if let Some(on_step) = &req.on_step {
                    on_step(StepEvent::AssistantText(response.content.clone()));
                }
            }

            let wants_tools = response.stop_reason == "tool_use" && !response.tool_calls.is_empty();
            if !wants_tools {
                if let Some(on_step) = &req.on_step {
                    on_step(StepEvent::StepFinish { step });
                }
                return Ok(self.finish(request_ctx, final_text, run_parts, tool_names, tool_errors));
            }

            // Record the assistant message (text + tool_use blocks) in the
            // in-flight suffix.
            let mut blocks: Vec<serde_json::Value> = Vec::new();
            if !response.content.is_empty() {
                blocks.push(serde_json::json!({ "type": "text", "text": response.content }));
            }
            for call in &response.tool_calls {
                blocks.push(serde_json::json!({
                    "type": "tool_use", "id": call.id, "name": call.name, "input": call.input,
                }));
            }
            suffix.push(serde_json::json!({ "role": "assistant", "content": blocks }));

            // Execute each call; the executor runs the drain hook after
            // every one.
            let mut result_blocks: Vec<serde_json::Value> = Vec::new();
            for call in &response.tool_calls {
                tool_names.push(call.name.clone());
                run_parts.push(Part::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });

                let (result, drained) = executor.execute(call, request_ctx).await;
                if drained.drained > 0 {
                    if let Some(last) = drained.messages.last() {
                        request_ctx.update_target(last);
                    }
                    reload_prefix = true;
                }
                if result.reports_failure() {
                    tool_errors.push((call.name.clone(), summarize_error(&result.output)));
                }

                run_parts.push(Part::ToolOutput {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: result.output.clone(),
                });
                result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": result.output.to_string(),
                    "is_error": result.is_error,
                }));
            }
            suffix.push(serde_json::json!({ "role": "user", "content": result_blocks }));

            if let Some(on_step) = &req.on_step {
                on_step(StepEvent::StepFinish { step });
            }
        }

        info!(context = %request_ctx.context_id, "step cap reached, ending slice");
        Ok(self.finish(request_ctx, final_text, run_parts, tool_names, tool_errors))
    }

    /// Build the outcome and the synthesized assistant turn.
    fn finish(
        &self,
        request_ctx: &RequestContext,
        final_text: String,
        mut run_parts: Vec<Part>,
        tool_names: Vec<String>,
        tool_errors: Vec<(String, String)>,
    ) -> RunOutcome {
        let mut output = if final_text.is_empty() {
            "I hit the step limit before producing a final answer.".to_string()
        } else {
            final_text
        };
        if !tool_errors.is_empty() {
            output.push_str("\n\nTool errors:\n");
            for (name, summary) in &tool_errors {
                output.push_str(&format!("- {name}: {summary}\n"));
            }
        }
        if run_parts.is_empty() {
            run_parts.push(Part::text(&output));
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let assistant = TurnMessage {
            id: format!("a:{}:{}", request_ctx.context_id, now_ms),
            role: Role::Assistant,
            parts: run_parts,
            metadata: TurnMetadata {
                v: ship_core::types::SCHEMA_VERSION,
                ts: now_ms,
                context_id: request_ctx.context_id.clone(),
                channel: request_ctx.channel.clone(),
                target_id: request_ctx.target_id.clone(),
                actor_id: "bot".to_string(),
                actor_name: None,
                message_id: None,
                thread_id: request_ctx.thread_id,
                source: Source::Egress,
                kind: Kind::Normal,
                source_range: None,
                request_id: Some(request_ctx.request_id.clone()),
            },
        };

        RunOutcome {
            success: true,
            output,
            tool_calls: tool_names,
            assistant_message: Some(assistant),
        }
    }
}

/// Clip a tool error payload to a short summary.
fn summarize_error(output: &serde_json::Value) -> String {
    let text = output
        .get("error")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| output.to_string());
    if text.chars().count() <= TOOL_ERROR_SUMMARY_MAX {
        return text;
    }
    text.chars().take(TOOL_ERROR_SUMMARY_MAX).collect()
}

// ---------------------------------------------------------------------------
// Compaction summarizer
// ---------------------------------------------------------------------------

/// [`Summarizer`] over the runner's model provider.
struct ProviderSummarizer {
    provider: Arc<dyn ModelProvider>,
    model: String,
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, transcript: &str) -> std::result::Result<String, String> {
        let request = ModelRequest {
            model: self.model.clone(),
            system: concat!(
                "Summarize the conversation below as concise Markdown. Preserve decisions, ",
                "facts, names, open tasks, and anything the assistant promised to do. ",
                "Write in the third person; do not address the user."
            )
            .to_string(),
            messages: vec![serde_json::json!({
                "role": "user",
                "content": [{ "type": "text", "text": transcript }],
            })],
            max_tokens: 1024,
            tools: Vec::new(),
        };
        match self.provider.send(&request).await {
            Ok(response) => Ok(response.content),
            Err(e) => Err(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
