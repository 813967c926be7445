//! HTTP ingress: the three POST routes every node exposes.
//!
//! Bodies are parsed strictly against the wire contract — malformed JSON or
//! unknown fields come back as 422, without touching the counters or pools.
//! Method routing handles the 405 side.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use evbus_protocol::Event;
use futures_util::FutureExt;
use serde_json::json;
use tracing::{debug, error};

use crate::hooks::NodeBehavior;
use crate::listener::{NodeContext, panic_message};

#[derive(Clone)]
struct IngressState {
    ctx: Arc<NodeContext>,
    behavior: Arc<dyn NodeBehavior>,
}

pub fn build_router(ctx: Arc<NodeContext>, behavior: Arc<dyn NodeBehavior>) -> Router {
    Router::new()
        .route("/event", post(handle_event))
        .route("/state", post(handle_state))
        .route("/discovery", post(handle_discovery))
        .with_state(IngressState { ctx, behavior })
}

fn ok_response() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

fn parse_event(body: &Bytes) -> Result<Event, Response> {
    serde_json::from_slice(body).map_err(|err| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"status": "error", "detail": err.to_string()})),
        )
            .into_response()
    })
}

async fn handle_event(State(state): State<IngressState>, body: Bytes) -> Response {
    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(rejection) => return rejection,
    };
    debug!(
        source = %event.source,
        source_address = %event.source_address,
        source_port = event.source_port,
        event_type = %event.event_type,
        "event received"
    );
    state.ctx.bump_received();
    if let Err(err) = state.ctx.incoming().append(event) {
        error!("failed to enqueue received event: {err}");
    }
    ok_response()
}

async fn handle_state(State(state): State<IngressState>, body: Bytes) -> Response {
    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(rejection) => return rejection,
    };
    if let Err(payload) = AssertUnwindSafe(state.behavior.on_state(&state.ctx, event))
        .catch_unwind()
        .await
    {
        error!("on_state hook panicked: {}", panic_message(payload.as_ref()));
    }
    ok_response()
}

async fn handle_discovery(State(state): State<IngressState>, body: Bytes) -> Response {
    let event = match parse_event(&body) {
        Ok(event) => event,
        Err(rejection) => return rejection,
    };
    if let Err(payload) = AssertUnwindSafe(state.behavior.on_discovery(&state.ctx, event))
        .catch_unwind()
        .await
    {
        error!(
            "on_discovery hook panicked: {}",
            panic_message(payload.as_ref())
        );
    }
    ok_response()
}
