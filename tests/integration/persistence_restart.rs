//! Full-node persistence: a running node is shut down, its queues and
//! state land in the snapshot, and a successor node with the same name
//! picks everything up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use evbus::{
    Event, EventListener, ListenerOptions, ListenerState, NodeBehavior, NodeContext,
};
use serde_json::{Map, json};

const PORT: u16 = 42301;

/// Keeps every incoming event in the pool.
struct KeepAllBehavior;

#[async_trait]
impl NodeBehavior for KeepAllBehavior {
    async fn analyze_event(&self, _node: &NodeContext, _event: &Event) -> bool {
        false
    }
}

fn options(dir: &tempfile::TempDir) -> ListenerOptions {
    let mut options = ListenerOptions::new("resume");
    options.port = PORT;
    options.state_dir = dir.path().to_path_buf();
    options.config_dir = dir.path().to_path_buf();
    options.stabilization = Duration::from_millis(100);
    // Outgoing events must survive until shutdown even though their
    // destination is unreachable.
    options.max_retries = 1_000_000;
    options
}

async fn start_node(node: &Arc<EventListener>) {
    let clone = node.clone();
    tokio::spawn(async move {
        clone.start().await.expect("node failed to start");
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.context().lifecycle() != ListenerState::Running {
        assert!(Instant::now() < deadline, "node never reached RUNNING");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn wire_event(event_type: &str) -> serde_json::Value {
    let event = Event::new(
        "peer",
        "127.0.0.1",
        9901,
        "resume",
        "127.0.0.1",
        PORT,
        event_type,
        Map::new(),
    );
    serde_json::to_value(&event).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_node_restores_queues_and_state() {
    let dir = tempfile::tempdir().unwrap();

    let first = Arc::new(EventListener::new(options(&dir), Arc::new(KeepAllBehavior)));
    start_node(&first).await;

    // Two incoming events over HTTP; KeepAllBehavior leaves them pooled.
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{PORT}");
    for event_type in ["in_a", "in_b"] {
        let response = client
            .post(format!("{base}/event"))
            .json(&wire_event(event_type))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    // One in-flight request, two pending sends, some application state.
    let ctx = first.context();
    let mut in_flight = Event::new(
        "peer",
        "127.0.0.1",
        9901,
        "resume",
        "127.0.0.1",
        PORT,
        "work",
        Map::new(),
    );
    in_flight.id = Some(5);
    ctx.add_to_processing(in_flight);
    for i in 0..2i64 {
        ctx.emit("ghost", "127.0.0.1", 1, "out", Some(i), Map::new(), true, None);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    {
        let mut state = ctx.state();
        state.insert("k".to_owned(), json!("v"));
        state.insert("n".to_owned(), json!(7));
    }

    // Wait until both incoming events are visible, then stop the node.
    let deadline = Instant::now() + Duration::from_secs(5);
    while ctx.incoming().len() < 2 {
        assert!(Instant::now() < deadline, "incoming events never pooled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(first.shutdown().await);

    let state_file = options(&dir).state_file_path();
    assert!(state_file.exists(), "snapshot written at shutdown");

    // The successor inherits everything; the snapshot file is consumed.
    let second = EventListener::new(options(&dir), Arc::new(KeepAllBehavior));
    let ctx = second.context();

    let incoming_types: Vec<String> = ctx
        .incoming()
        .snapshot()
        .into_iter()
        .map(|meta| meta.event.event_type)
        .collect();
    assert_eq!(incoming_types, vec!["in_a".to_owned(), "in_b".to_owned()]);

    assert_eq!(ctx.processing().len(), 1);
    let restored = ctx.processing().peek_oldest().unwrap().event;
    assert_eq!(restored.id, Some(5));
    assert!(restored.is_processing);

    assert_eq!(ctx.outgoing().len(), 2);
    for meta in ctx.outgoing().snapshot() {
        assert_eq!(meta.retry_count, 0, "retry counters reset on restart");
        assert_eq!(meta.event.event_type, "out");
    }

    assert_eq!(ctx.state().get("k"), Some(&json!("v")));
    assert_eq!(ctx.state().get("n"), Some(&json!(7)));

    assert!(!state_file.exists(), "snapshot consumed by the load");
}
