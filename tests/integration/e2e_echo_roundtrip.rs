//! Echo round trip between two in-process nodes.
//!
//! Node B moves every incoming event into its processing pool, completes it
//! on the next local-data tick with a success result, and replies.  Node A
//! keeps its incoming events so the test can observe the reply arriving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use evbus::{
    Event, EventListener, EventResult, ListenerOptions, ListenerState, NodeBehavior, NodeContext,
};
use serde_json::Map;

const PORT_A: u16 = 42101;
const PORT_B: u16 = 42102;

/// Keeps every incoming event in the pool for inspection.
struct KeepAllBehavior;

#[async_trait]
impl NodeBehavior for KeepAllBehavior {
    async fn analyze_event(&self, _node: &NodeContext, _event: &Event) -> bool {
        false
    }
}

/// Echoes every request back with a success result.
struct EchoBehavior;

#[async_trait]
impl NodeBehavior for EchoBehavior {
    async fn analyze_event(&self, node: &NodeContext, event: &Event) -> bool {
        node.add_to_processing(event.clone());
        true
    }

    async fn check_local_data(&self, node: &NodeContext) {
        let Some(oldest) = node.processing().peek_oldest() else {
            return;
        };
        let Some(mut event) = node.find_and_remove_processing_event(
            &oldest.event.event_type,
            oldest.event.id,
            None,
        ) else {
            return;
        };
        event.result = Some(EventResult::success());
        let _ = node.reply(event);
    }
}

fn options(name: &str, port: u16, dir: &tempfile::TempDir) -> ListenerOptions {
    let mut options = ListenerOptions::new(name);
    options.port = port;
    options.state_dir = dir.path().to_path_buf();
    options.config_dir = dir.path().to_path_buf();
    options.stabilization = Duration::from_millis(100);
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

#[tokio::test(flavor = "multi_thread")]
async fn ping_is_answered_with_a_success_reply() {
    let dir = tempfile::tempdir().unwrap();
    let node_a = Arc::new(EventListener::new(
        options("a", PORT_A, &dir),
        Arc::new(KeepAllBehavior),
    ));
    let node_b = Arc::new(EventListener::new(
        options("b", PORT_B, &dir),
        Arc::new(EchoBehavior),
    ));
    start_node(&node_a).await;
    start_node(&node_b).await;

    node_a.context().emit(
        "b",
        "127.0.0.1",
        PORT_B,
        "ping",
        Some(42),
        Map::new(),
        true,
        None,
    );

    // The reply lands in A's incoming pool, where KeepAllBehavior leaves it.
    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = loop {
        let matches = node_a.context().incoming().filter(|meta| {
            meta.event.event_type == "ping"
                && meta.event.id == Some(42)
                && meta.event.result.is_some()
        });
        if let Some(meta) = matches.into_iter().next() {
            break meta.event;
        }
        assert!(Instant::now() < deadline, "no reply arrived on node A");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(
        reply.result.as_ref().and_then(|r| r.result.as_deref()),
        Some("success")
    );
    assert_eq!(reply.source, "b");
    assert_eq!(reply.destination, "a");

    assert_eq!(node_a.context().received_events(), 1);
    assert_eq!(node_a.context().sent_events(), 1);
    assert_eq!(node_b.context().received_events(), 1);
    assert_eq!(node_b.context().sent_events(), 1);
    assert!(node_b.context().processing().is_empty());

    node_a.shutdown().await;
    node_b.shutdown().await;
}
