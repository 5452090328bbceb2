//! Per-context lane scheduler.
//!
//! Every context owns a FIFO lane; a worker runs exactly one head-of-lane
//! message (a slice) before releasing the lane back to the runnable queue,
//! so long conversations cannot starve others beyond one slice. Follow-on
//! messages on the same lane can fold into a running slice at tool
//! boundaries (correction merge) instead of waiting behind it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use ship_agent::runner::{DrainFn, DrainOutcome, RunRequest};
use ship_agent::AgentRunner;
use ship_core::types::{InboundMessage, Kind, Part, Role, Source, TurnMessage, TurnMetadata};
use ship_core::{RequestContext, ShipConfig};
use ship_store::ContextStore;

use crate::error::Result;

/// Interval between typing-indicator emissions during a slice.
const TYPING_HEARTBEAT: Duration = Duration::from_secs(4);

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Result handed to the delivery callback after a slice commits.
#[derive(Debug, Clone)]
pub struct DeliveredResult {
    pub context: RequestContext,
    pub output: String,
    pub success: bool,
}

/// Outbound delivery hook. Errors are logged and swallowed — delivery
/// problems never affect the scheduler.
pub type DeliverFn =
    Arc<dyn Fn(DeliveredResult) -> std::result::Result<(), String> + Send + Sync>;

/// Presence hook, e.g. a platform "typing" indicator.
pub type SendActionFn = Arc<dyn Fn(&RequestContext, &str) + Send + Sync>;

/// Lazily resolves the runner for a context.
pub type RunnerFactory = Arc<dyn Fn(&str) -> Arc<AgentRunner> + Send + Sync>;

/// Lazily resolves the store for a context.
pub type StoreFactory =
    Arc<dyn Fn(&str) -> std::result::Result<Arc<ContextStore>, ship_store::StoreError> + Send + Sync>;

/// Fired after a slice's assistant turn has been committed and delivered.
pub type AfterCommitFn = Arc<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub enable_correction_merge: bool,
    pub correction_max_rounds: usize,
    pub correction_max_merged_messages: usize,
}

impl SchedulerConfig {
    pub fn from_config(config: &ShipConfig) -> Self {
        let queue = &config.context.chat_queue;
        Self {
            max_concurrency: queue.effective_max_concurrency(),
            enable_correction_merge: queue.enable_correction_merge,
            correction_max_rounds: queue.effective_correction_max_rounds(),
            correction_max_merged_messages: queue.effective_correction_max_merged(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_config(&ShipConfig::default())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Lane {
    channel: String,
    queue: VecDeque<InboundMessage>,
    running: bool,
}

#[derive(Default)]
struct SchedState {
    lanes: HashMap<String, Lane>,
    runnable: VecDeque<String>,
    runnable_set: HashSet<String>,
    running_total: usize,
}

impl SchedState {
    fn mark_runnable(&mut self, context_id: &str) {
        if self.runnable_set.insert(context_id.to_string()) {
            self.runnable.push_back(context_id.to_string());
        }
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub lanes: usize,
    pub pending_total: usize,
    pub running_total: usize,
    pub pending_by_channel: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// LaneScheduler
// ---------------------------------------------------------------------------

pub struct LaneScheduler {
    state: Arc<StdMutex<SchedState>>,
    config: SchedulerConfig,
    runner_for: RunnerFactory,
    store_for: StoreFactory,
    deliver: Option<DeliverFn>,
    send_action: Option<SendActionFn>,
    after_commit: Option<AfterCommitFn>,
}

impl LaneScheduler {
    pub fn new(
        config: SchedulerConfig,
        runner_for: RunnerFactory,
        store_for: StoreFactory,
        deliver: Option<DeliverFn>,
        send_action: Option<SendActionFn>,
        after_commit: Option<AfterCommitFn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(StdMutex::new(SchedState::default())),
            config,
            runner_for,
            store_for,
            deliver,
            send_action,
            after_commit,
        })
    }

    /// Queue a message onto its context's lane and kick the workers.
    pub fn enqueue(self: &Arc<Self>, msg: InboundMessage) -> Result<()> {
        let context_id = ship_core::paths::validate_context_id(&msg.context_id)?.to_string();
        {
            let mut st = self.state.lock().unwrap();
            let lane = st.lanes.entry(context_id.clone()).or_insert_with(|| Lane {
                channel: msg.channel.clone(),
                queue: VecDeque::new(),
                running: false,
            });
            lane.queue.push_back(msg);
            st.mark_runnable(&context_id);
        }
        self.kick();
        Ok(())
    }

    pub fn stats(&self) -> SchedulerStats {
        let st = self.state.lock().unwrap();
        let mut pending_by_channel: HashMap<String, usize> = HashMap::new();
        let mut pending_total = 0;
        for lane in st.lanes.values() {
            pending_total += lane.queue.len();
            if !lane.queue.is_empty() {
                *pending_by_channel.entry(lane.channel.clone()).or_default() += lane.queue.len();
            }
        }
        SchedulerStats {
            lanes: st.lanes.len(),
            pending_total,
            running_total: st.running_total,
            pending_by_channel,
        }
    }

    /// Spawn workers for runnable lanes while concurrency slots remain.
    fn kick(self: &Arc<Self>) {
        loop {
            let next = {
                let mut st = self.state.lock().unwrap();
                if st.running_total >= self.config.max_concurrency {
                    None
                } else {
                    let mut claimed = None;
                    while let Some(context_id) = st.runnable.pop_front() {
                        st.runnable_set.remove(&context_id);
                        let claim = st
                            .lanes
                            .get_mut(&context_id)
                            .filter(|lane| !lane.running && !lane.queue.is_empty());
                        if let Some(lane) = claim {
                            lane.running = true;
                            st.running_total += 1;
                            claimed = Some(context_id);
                            break;
                        }
                    }
                    claimed
                }
            };

            match next {
                Some(context_id) => {
                    let sched = Arc::clone(self);
                    tokio::spawn(async move {
                        sched.run_slice(context_id).await;
                    });
                }
                None => break,
            }
        }
    }

    /// One time-slice: exactly one head-of-lane message.
    async fn run_slice(self: Arc<Self>, context_id: String) {
        let msg = {
            let mut st = self.state.lock().unwrap();
            st.lanes
                .get_mut(&context_id)
                .and_then(|lane| lane.queue.pop_front())
        };

        if let Some(msg) = msg {
            // Errors are contained in the worker's outermost frame; the lane
            // always continues.
            if let Err(e) = self.process(&context_id, msg).await {
                error!(context = %context_id, error = %e, code = e.code(), "slice failed");
            }
        }

        {
            let mut st = self.state.lock().unwrap();
            st.running_total -= 1;
            if let Some(lane) = st.lanes.get_mut(&context_id) {
                lane.running = false;
                if !lane.queue.is_empty() {
                    st.mark_runnable(&context_id);
                }
            }
        }
        self.kick();
    }

    async fn process(&self, context_id: &str, msg: InboundMessage) -> Result<()> {
        let request_id = format!("req-{}", uuid::Uuid::new_v4().simple());
        let ctx = RequestContext::from_message(&msg, request_id);
        let store = (self.store_for)(context_id)?;
        let runner = (self.runner_for)(context_id);

        let drain = self
            .config
            .enable_correction_merge
            .then(|| self.drain_fn(context_id, Arc::clone(&store)));

        let heartbeat = self.send_action.as_ref().map(|send| {
            let send = Arc::clone(send);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TYPING_HEARTBEAT);
                loop {
                    ticker.tick().await;
                    send(&ctx, "typing");
                }
            })
        });

        let outcome = runner
            .run(RunRequest {
                context: ctx.clone(),
                query: msg.text.clone(),
                drain_lane_merged: drain,
                on_step: None,
            })
            .await;

        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(context = %context_id, error = %e, code = e.code(), "runner failed");
                return Ok(());
            }
        };

        // Commit: the scheduler is the single append site for assistant
        // turns.
        let mut delivery_ctx = ctx;
        if let Some(turn) = &outcome.assistant_message {
            delivery_ctx.channel = turn.metadata.channel.clone();
            delivery_ctx.target_id = turn.metadata.target_id.clone();
            if let Err(e) = store.append(turn).await {
                error!(context = %context_id, error = %e, "failed to append assistant turn");
            }
        }

        if let Some(deliver) = &self.deliver {
            let result = DeliveredResult {
                context: delivery_ctx,
                output: outcome.output.clone(),
                success: outcome.success,
            };
            if let Err(e) = deliver(result) {
                warn!(context = %context_id, error = %e, "deliverResult failed (swallowed)");
            }
        }

        if let Some(hook) = &self.after_commit {
            hook(context_id);
        }

        info!(
            context = %context_id,
            success = outcome.success,
            tools = outcome.tool_calls.len(),
            "slice committed"
        );
        Ok(())
    }

    /// Build the correction-merge callback for one slice.
    ///
    /// Each invocation drains up to `correctionMaxMergedMessages` queued
    /// messages from this lane (at most `correctionMaxRounds` productive
    /// rounds per slice), appends their user turns in enqueue order, and
    /// returns them so the runner reloads the transcript. Cooperation, not
    /// preemption: it only runs when the runner is between tool calls.
    fn drain_fn(&self, context_id: &str, store: Arc<ContextStore>) -> DrainFn {
        let state = Arc::clone(&self.state);
        let context_id = context_id.to_string();
        let max_rounds = self.config.correction_max_rounds;
        let max_merged = self.config.correction_max_merged_messages;
        let rounds_used = Arc::new(AtomicUsize::new(0));

        Arc::new(move || {
            let state = Arc::clone(&state);
            let store = Arc::clone(&store);
            let context_id = context_id.clone();
            let rounds_used = Arc::clone(&rounds_used);
            Box::pin(async move {
                if rounds_used.load(Ordering::SeqCst) >= max_rounds {
                    return DrainOutcome::default();
                }

                let drained: Vec<InboundMessage> = {
                    let mut st = state.lock().unwrap();
                    match st.lanes.get_mut(&context_id) {
                        Some(lane) => {
                            let take = lane.queue.len().min(max_merged);
                            lane.queue.drain(..take).collect()
                        }
                        None => Vec::new(),
                    }
                };
                if drained.is_empty() {
                    return DrainOutcome::default();
                }
                rounds_used.fetch_add(1, Ordering::SeqCst);

                for msg in &drained {
                    if let Err(e) = store.append(&ingress_turn(msg)).await {
                        error!(context = %context_id, error = %e, "failed to append merged turn");
                    }
                }
                debug!(context = %context_id, drained = drained.len(), "lane drained into slice");

                DrainOutcome {
                    drained: drained.len(),
                    messages: drained,
                }
            })
        })
    }
}

/// Build the ingress user turn for a drained message.
fn ingress_turn(msg: &InboundMessage) -> TurnMessage {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let id = match &msg.message_id {
        Some(mid) => format!("u:{}:{}", msg.context_id, mid),
        None => format!("u:{}:{}", msg.context_id, now_ms),
    };
    TurnMessage {
        id,
        role: Role::User,
        parts: vec![Part::text(&msg.text)],
        metadata: TurnMetadata {
            v: ship_core::types::SCHEMA_VERSION,
            ts: now_ms,
            context_id: msg.context_id.clone(),
            channel: msg.channel.clone(),
            target_id: msg.target_id.clone(),
            actor_id: msg.actor_id.clone(),
            actor_name: msg.actor_name.clone(),
            message_id: msg.message_id.clone(),
            thread_id: msg.thread_id,
            source: Source::Ingress,
            kind: Kind::Normal,
            source_range: None,
            request_id: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_clamps_from_ship_config() {
        let mut cfg = ShipConfig::default();
        cfg.context.chat_queue.max_concurrency = 100;
        cfg.context.chat_queue.correction_max_rounds = 99;
        let sc = SchedulerConfig::from_config(&cfg);
        assert_eq!(sc.max_concurrency, 32);
        assert_eq!(sc.correction_max_rounds, 10);
    }

    #[test]
    fn mark_runnable_dedups() {
        let mut st = SchedState::default();
        st.mark_runnable("a");
        st.mark_runnable("a");
        st.mark_runnable("b");
        assert_eq!(st.runnable.len(), 2);
    }

    #[test]
    fn ingress_turn_id_is_deterministic_with_message_id() {
        let msg = InboundMessage {
            context_id: "ctx".into(),
            channel: "tg".into(),
            target_id: "t".into(),
            actor_id: "u".into(),
            actor_name: None,
            message_id: Some("m-9".into()),
            thread_id: None,
            text: "hello".into(),
        };
        assert_eq!(ingress_turn(&msg).id, "u:ctx:m-9");
    }
}
