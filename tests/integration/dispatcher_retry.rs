//! Dispatcher retry discipline against failing and unreachable peers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use evbus::{DefaultBehavior, EventListener, ListenerOptions, ListenerState};
use serde_json::Map;

const PORT_FAILING: u16 = 42201;
const PORT_UNREACHABLE: u16 = 42202;

fn options(name: &str, port: u16, dir: &tempfile::TempDir) -> ListenerOptions {
    let mut options = ListenerOptions::new(name);
    options.port = port;
    options.state_dir = dir.path().to_path_buf();
    options.config_dir = dir.path().to_path_buf();
    options.stabilization = Duration::from_millis(100);
    options.max_retries = 2;
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

async fn wait_for_drain(node: &EventListener, expected_drops: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let ctx = node.context();
        if ctx.outgoing().is_empty() && ctx.retry_exhausted_events() == expected_drops {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "outgoing pool did not drain: size={} drops={}",
            ctx.outgoing().len(),
            ctx.retry_exhausted_events()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A peer that accepts connections but rejects every event with 500.
async fn start_rejecting_peer(hits: Arc<AtomicU64>) -> std::net::SocketAddr {
    async fn reject(State(hits): State<Arc<AtomicU64>>) -> StatusCode {
        hits.fetch_add(1, Ordering::SeqCst);
        StatusCode::INTERNAL_SERVER_ERROR
    }

    let app = Router::new().route("/event", post(reject)).with_state(hits);
    let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(tcp, app).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_peer_gets_exactly_max_retries_attempts_per_event() {
    let dir = tempfile::tempdir().unwrap();
    let hits = Arc::new(AtomicU64::new(0));
    let peer = start_rejecting_peer(hits.clone()).await;

    let node = Arc::new(EventListener::new(
        options("retrier", PORT_FAILING, &dir),
        Arc::new(DefaultBehavior),
    ));
    start_node(&node).await;

    for i in 0..3i64 {
        node.context().emit(
            "blackhole",
            "127.0.0.1",
            peer.port(),
            "doomed",
            Some(i),
            Map::new(),
            true,
            None,
        );
        // Events are keyed by timestamp; keep them apart.
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    wait_for_drain(&node, 3).await;

    // max_retries = 2: each event is attempted twice, then dropped.
    assert_eq!(hits.load(Ordering::SeqCst), 6);
    assert_eq!(node.context().sent_events(), 0);
    assert_eq!(node.context().retry_exhausted_events(), 3);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_peer_drains_without_counting_sends() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(EventListener::new(
        options("stranded", PORT_UNREACHABLE, &dir),
        Arc::new(DefaultBehavior),
    ));
    start_node(&node).await;

    // Port 1 on loopback: connection refused immediately.
    node.context().emit(
        "ghost",
        "127.0.0.1",
        1,
        "lost",
        None,
        Map::new(),
        true,
        None,
    );

    wait_for_drain(&node, 1).await;
    assert_eq!(node.context().sent_events(), 0);

    node.shutdown().await;
}
