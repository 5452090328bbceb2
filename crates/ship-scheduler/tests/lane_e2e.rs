//! End-to-end lane scheduling over a scripted provider: per-context
//! serialization, cross-context parallelism, and correction merge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use ship_agent::mock::{MockProvider, MockTurn};
use ship_agent::{ModelProvider, SkillRegistry, Tool, ToolResult, ToolSet};
use ship_core::types::{InboundMessage, Role};
use ship_core::{RequestContext, ShipConfig, ShipPaths};
use ship_scheduler::manager::{ContextManager, ContextManagerConfig};
use ship_scheduler::scheduler::DeliveredResult;

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the input back"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, input: serde_json::Value, _ctx: &RequestContext) -> ToolResult {
        ToolResult::success(serde_json::json!({ "echo": input }))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    manager: Arc<ContextManager>,
    provider: Arc<MockProvider>,
    deliveries: Arc<Mutex<Vec<(Instant, DeliveredResult)>>>,
    after_updates: Arc<AtomicUsize>,
}

fn harness(turns: Vec<MockTurn>, provider_delay: Option<Duration>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut provider = MockProvider::new(turns);
    if let Some(delay) = provider_delay {
        provider = provider.with_delay(delay);
    }
    let provider = Arc::new(provider);

    let mut tools = ToolSet::new();
    tools.register(Arc::new(EchoTool));

    let deliveries: Arc<Mutex<Vec<(Instant, DeliveredResult)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deliveries);
    let after_updates = Arc::new(AtomicUsize::new(0));
    let update_counter = Arc::clone(&after_updates);

    let manager = ContextManager::new(ContextManagerConfig {
        paths: ShipPaths::new(dir.path()),
        config: ShipConfig::default(),
        provider: Arc::clone(&provider) as Arc<dyn ModelProvider>,
        tools: Arc::new(tools),
        skills: Arc::new(SkillRegistry::new()),
        model: "mock-model".into(),
        system_texts: Vec::new(),
        deliver: Some(Arc::new(move |result| {
            sink.lock().unwrap().push((Instant::now(), result));
            Ok(())
        })),
        send_action: None,
        after_update: Some(Arc::new(move |_context_id| {
            update_counter.fetch_add(1, Ordering::SeqCst);
        })),
    });

    Harness {
        _dir: dir,
        manager,
        provider,
        deliveries,
        after_updates,
    }
}

fn msg(context_id: &str, text: &str, message_id: &str) -> InboundMessage {
    InboundMessage {
        context_id: context_id.into(),
        channel: "test".into(),
        target_id: format!("target-{context_id}"),
        actor_id: "user-1".into(),
        actor_name: None,
        message_id: Some(message_id.into()),
        thread_id: None,
        text: text.into(),
    }
}

async fn wait_for_deliveries(h: &Harness, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if h.deliveries.lock().unwrap().len() >= n {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {n} deliveries");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_context_slices_serialize_in_order() {
    let h = harness(
        vec![
            MockTurn::Text("answer one".into()),
            MockTurn::Text("answer two".into()),
        ],
        Some(Duration::from_millis(50)),
    );

    h.manager.enqueue(msg("ctx-A", "ping", "m-1")).unwrap();
    h.manager.enqueue(msg("ctx-A", "pong", "m-2")).unwrap();
    wait_for_deliveries(&h, 2).await;

    let store = h.manager.get_store("ctx-A").unwrap();
    let turns = store.load_all().unwrap();
    assert_eq!(turns.len(), 4, "user/assistant pairs must interleave");
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text(), "ping");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].text(), "answer one");
    assert_eq!(turns[2].role, Role::User);
    assert_eq!(turns[2].text(), "pong");
    assert_eq!(turns[3].role, Role::Assistant);
    assert_eq!(turns[3].text(), "answer two");

    let stats = h.manager.stats();
    assert_eq!(stats.pending_total, 0);
    assert_eq!(stats.running_total, 0);
    assert_eq!(stats.lanes, 1);

    // The post-turn hook is detached; give it a moment to land.
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.after_updates.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "after-update hook never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_contexts_run_in_parallel() {
    let delay = Duration::from_millis(400);
    let h = harness(
        vec![
            MockTurn::Text("for A".into()),
            MockTurn::Text("for B".into()),
        ],
        Some(delay),
    );

    let started = Instant::now();
    h.manager.enqueue(msg("ctx-A", "hello", "m-1")).unwrap();
    h.manager.enqueue(msg("ctx-B", "hello", "m-2")).unwrap();
    wait_for_deliveries(&h, 2).await;

    let elapsed = started.elapsed();
    // Serialized execution would need at least 2 × delay.
    assert!(
        elapsed < delay * 2,
        "slices did not overlap: {elapsed:?} for delay {delay:?}"
    );

    let times: Vec<Instant> = h
        .deliveries
        .lock()
        .unwrap()
        .iter()
        .map(|(t, _)| *t)
        .collect();
    let gap = times[1].saturating_duration_since(times[0]);
    assert!(gap < delay, "deliveries too far apart: {gap:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn correction_merge_folds_followups_into_the_slice() {
    let h = harness(
        vec![
            MockTurn::ToolUse {
                text: "let me gather that".into(),
                id: "t1".into(),
                name: "echo".into(),
                input: serde_json::json!({"q": "summarize"}),
            },
            MockTurn::Text("only X, as requested".into()),
        ],
        Some(Duration::from_millis(150)),
    );

    h.manager
        .enqueue(msg("ctx-A", "summarize this", "m-1"))
        .unwrap();
    h.manager
        .enqueue(msg("ctx-A", "also include X", "m-2"))
        .unwrap();
    h.manager
        .enqueue(msg("ctx-A", "actually only X", "m-3"))
        .unwrap();
    wait_for_deliveries(&h, 1).await;

    // Give a would-be second slice time to run; none should.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.deliveries.lock().unwrap().len(), 1);
    assert_eq!(h.provider.calls(), 2);

    let store = h.manager.get_store("ctx-A").unwrap();
    let turns = store.load_all().unwrap();
    let texts: Vec<String> = turns.iter().map(|t| t.text()).collect();
    assert_eq!(turns.len(), 4, "three user turns then one assistant: {texts:?}");
    assert_eq!(turns[0].text(), "summarize this");
    assert_eq!(turns[1].text(), "also include X");
    assert_eq!(turns[2].text(), "actually only X");
    assert_eq!(turns[3].role, Role::Assistant);
    assert!(turns[3].text().contains("only X, as requested"));

    assert_eq!(h.manager.stats().pending_total, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivery_errors_are_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(vec![
        MockTurn::Text("one".into()),
        MockTurn::Text("two".into()),
    ]));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);

    let manager = ContextManager::new(ContextManagerConfig {
        paths: ShipPaths::new(dir.path()),
        config: ShipConfig::default(),
        provider: Arc::clone(&provider) as Arc<dyn ModelProvider>,
        tools: Arc::new(ToolSet::new()),
        skills: Arc::new(SkillRegistry::new()),
        model: "mock-model".into(),
        system_texts: Vec::new(),
        deliver: Some(Arc::new(move |_result| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("platform adapter exploded".into())
        })),
        send_action: None,
        after_update: None,
    });

    manager.enqueue(msg("ctx-A", "first", "m-1")).unwrap();
    manager.enqueue(msg("ctx-A", "second", "m-2")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    while delivered.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "second slice never ran");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Both slices committed despite the failing delivery hook.
    let turns = manager.get_store("ctx-A").unwrap().load_all().unwrap();
    assert_eq!(turns.len(), 4);
}

#[tokio::test]
async fn empty_context_id_fails_fast() {
    let h = harness(vec![], None);
    let err = h.manager.enqueue(msg("  ", "hello", "m-1")).err().unwrap();
    assert_eq!(err.code(), "invalid_context_id");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn typing_heartbeat_fires_during_slow_slices() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(
        MockProvider::new(vec![MockTurn::Text("slow answer".into())])
            .with_delay(Duration::from_millis(4_500)),
    );
    let actions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&actions);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let manager = ContextManager::new(ContextManagerConfig {
        paths: ShipPaths::new(dir.path()),
        config: ShipConfig::default(),
        provider: Arc::clone(&provider) as Arc<dyn ModelProvider>,
        tools: Arc::new(ToolSet::new()),
        skills: Arc::new(SkillRegistry::new()),
        model: "mock-model".into(),
        system_texts: Vec::new(),
        deliver: Some(Arc::new(move |result| {
            let _ = tx.send(result);
            Ok(())
        })),
        send_action: Some(Arc::new(move |_ctx, action| {
            assert_eq!(action, "typing");
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        after_update: None,
    });

    manager.enqueue(msg("ctx-A", "think hard", "m-1")).unwrap();
    tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("delivery channel open");

    // ~4.5 s slice with a 4 s heartbeat: the immediate tick plus at least
    // one periodic tick.
    assert!(actions.load(Ordering::SeqCst) >= 2);
}
