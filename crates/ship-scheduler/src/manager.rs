//! Context manager — lazy per-context singletons behind one `enqueue`
//! surface.
//!
//! Stores and runners are created on first touch and cached; the transcript
//! itself lives on disk forever, so recycling an in-memory runner
//! (`clear_runner`) never loses history.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use ship_agent::runner::RunnerSettings;
use ship_agent::{AgentRunner, ModelProvider, SkillRegistry, ToolSet};
use ship_core::types::InboundMessage;
use ship_core::{ShipConfig, ShipPaths};
use ship_store::ContextStore;

use crate::error::Result;
use crate::scheduler::{
    DeliverFn, LaneScheduler, SchedulerConfig, SchedulerStats, SendActionFn,
};

/// Post-turn hook: memory extraction, summaries, other side tasks. Runs
/// detached and best-effort; never blocks the scheduler.
pub type AfterUpdateFn = Arc<dyn Fn(String) + Send + Sync>;

/// Everything needed to build per-context runners.
pub struct ContextManagerConfig {
    pub paths: ShipPaths,
    pub config: ShipConfig,
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolSet>,
    pub skills: Arc<SkillRegistry>,
    pub model: String,
    pub system_texts: Vec<String>,
    pub deliver: Option<DeliverFn>,
    pub send_action: Option<SendActionFn>,
    pub after_update: Option<AfterUpdateFn>,
}

struct ManagerState {
    paths: ShipPaths,
    config: ShipConfig,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolSet>,
    skills: Arc<SkillRegistry>,
    model: String,
    system_texts: Vec<String>,
    stores: DashMap<String, Arc<ContextStore>>,
    runners: DashMap<String, Arc<AgentRunner>>,
}

impl ManagerState {
    fn store(&self, context_id: &str) -> std::result::Result<Arc<ContextStore>, ship_store::StoreError> {
        if let Some(store) = self.stores.get(context_id) {
            return Ok(Arc::clone(&store));
        }
        let store = Arc::new(ContextStore::open(&self.paths, context_id)?);
        self.stores.insert(context_id.to_string(), Arc::clone(&store));
        Ok(store)
    }

    fn runner(&self, context_id: &str) -> Arc<AgentRunner> {
        if let Some(runner) = self.runners.get(context_id) {
            return Arc::clone(&runner);
        }
        let store = self
            .store(context_id)
            .expect("store creation for scheduled context");
        let runner = Arc::new(
            AgentRunner::new(
                store,
                Arc::clone(&self.provider),
                Arc::clone(&self.tools),
                Arc::clone(&self.skills),
                self.paths.clone(),
                RunnerSettings::from_config(&self.config, self.model.clone()),
            )
            .with_system_texts(self.system_texts.clone()),
        );
        self.runners
            .insert(context_id.to_string(), Arc::clone(&runner));
        runner
    }
}

/// Per-context lanes, stores, and runners behind a single façade.
pub struct ContextManager {
    state: Arc<ManagerState>,
    scheduler: Arc<LaneScheduler>,
    after_update: Option<AfterUpdateFn>,
}

/// Counters surfaced by [`ContextManager::stats`].
pub type ManagerStats = SchedulerStats;

impl ContextManager {
    pub fn new(config: ContextManagerConfig) -> Arc<Self> {
        let state = Arc::new(ManagerState {
            paths: config.paths,
            config: config.config,
            provider: config.provider,
            tools: config.tools,
            skills: config.skills,
            model: config.model,
            system_texts: config.system_texts,
            stores: DashMap::new(),
            runners: DashMap::new(),
        });

        let runner_state = Arc::clone(&state);
        let store_state = Arc::clone(&state);
        let after_update = config.after_update;
        let after_commit = after_update.as_ref().map(|hook| {
            let hook = Arc::clone(hook);
            Arc::new(move |context_id: &str| {
                // Detach: side tasks must never block the worker.
                let hook = Arc::clone(&hook);
                let context_id = context_id.to_string();
                tokio::spawn(async move {
                    hook(context_id);
                });
            }) as crate::scheduler::AfterCommitFn
        });

        let scheduler = LaneScheduler::new(
            SchedulerConfig::from_config(&state.config),
            Arc::new(move |context_id| runner_state.runner(context_id)),
            Arc::new(move |context_id| store_state.store(context_id)),
            config.deliver,
            config.send_action,
            after_commit,
        );

        Arc::new(Self {
            state,
            scheduler,
            after_update,
        })
    }

    /// Queue an inbound platform message for its context.
    ///
    /// A missing platform message id is replaced with a generated one so
    /// the user-turn id stays deterministic through retries and merges.
    pub fn enqueue(&self, mut msg: InboundMessage) -> Result<()> {
        ship_core::paths::validate_context_id(&msg.context_id)?;
        if msg.message_id.is_none() {
            msg.message_id = Some(format!("gen-{}", uuid::Uuid::new_v4().simple()));
        }
        self.scheduler.enqueue(msg)
    }

    /// Recycle the in-memory runner for a context. The transcript is
    /// untouched; the next slice builds a fresh runner over it.
    pub fn clear_runner(&self, context_id: &str) {
        if self.state.runners.remove(context_id).is_some() {
            debug!(context = %context_id, "runner cleared");
        }
    }

    /// The (cached) store for a context.
    pub fn get_store(&self, context_id: &str) -> Result<Arc<ContextStore>> {
        ship_core::paths::validate_context_id(context_id)?;
        self.state.store(context_id).map_err(Into::into)
    }

    pub fn stats(&self) -> ManagerStats {
        self.scheduler.stats()
    }

    /// Fire the post-turn side tasks for a context explicitly (the
    /// scheduler also calls this automatically after each commit when a
    /// hook is configured). Detached and best-effort.
    pub fn after_context_updated(&self, context_id: &str) {
        let Some(hook) = &self.after_update else {
            return;
        };
        if let Err(e) = ship_core::paths::validate_context_id(context_id) {
            warn!(error = %e, "after-update hook skipped");
            return;
        }
        let hook = Arc::clone(hook);
        let context_id = context_id.to_string();
        tokio::spawn(async move {
            hook(context_id);
        });
    }
}
