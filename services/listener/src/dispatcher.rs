//! Outgoing dispatcher: drains the outgoing pool and POSTs each event to
//! its destination's `/event` endpoint.
//!
//! Delivery is at-least-once.  A failed POST (connect refused, timeout,
//! reset, non-2xx) puts the event back with `retry_count + 1`; an event that
//! reaches the retry cap is dropped with an ERROR diagnostic.  Within one
//! destination the pool's FIFO order is preserved at best effort; across
//! destinations there is no ordering.
//!
//! Outbound timeouts are deliberately short (25 ms connect and read): peers
//! are LAN-local, failing fast keeps the loop live, and retries absorb the
//! transient misses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use evbus_core::ControlLoop;
use evbus_protocol::Event;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::listener::{NodeContext, period_of, wait_until_ready};

/// Connect and read timeout for outbound POSTs.
pub const OUTBOUND_TIMEOUT: Duration = Duration::from_millis(25);

/// The dispatcher loop body.  Spawned by the listener; runs until the
/// shutdown flag is set.
pub(crate) async fn send_event_loop(
    ctx: Arc<NodeContext>,
    mut ready: watch::Receiver<bool>,
    frequency: f64,
    report_overtime: bool,
    batch_size: usize,
    max_retries: u32,
) {
    debug!("starting send_event loop");
    let client = match reqwest::Client::builder()
        .connect_timeout(OUTBOUND_TIMEOUT)
        .timeout(OUTBOUND_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!("failed to build outbound HTTP client: {err}");
            return;
        }
    };
    let mut url_cache: HashMap<u16, String> = HashMap::new();
    let mut control = ControlLoop::new("send_event_loop", period_of(frequency), report_overtime)
        .with_overtime_sink(ctx.dispatcher_overtime.clone());

    if !wait_until_ready(&ctx, &mut ready).await {
        debug!("send_event loop cancelled during startup");
        return;
    }
    debug!("send_event loop activated");

    while !ctx.shutdown_requested() {
        control.loop_begin();

        let batch = ctx.outgoing().pop_batch(batch_size);
        if !batch.is_empty() {
            debug!(count = batch.len(), "sending events");
        }

        let mut failed: Vec<(Event, u32)> = Vec::new();
        for meta in batch {
            let event = meta.event;
            if meta.retry_count >= max_retries {
                ctx.retry_exhausted_events.fetch_add(1, Ordering::Relaxed);
                error!(
                    event_type = %event.event_type,
                    destination = %event.destination,
                    retries = meta.retry_count,
                    "event dropped after exhausting retries"
                );
                continue;
            }

            let url = url_cache
                .entry(event.destination_port)
                .or_insert_with(|| {
                    format!(
                        "http://{}:{}/event",
                        event.destination_address, event.destination_port
                    )
                })
                .clone();

            debug!(
                destination = %event.destination,
                url = %url,
                event_type = %event.event_type,
                "sending event"
            );
            match client.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    ctx.bump_sent();
                }
                Ok(response) => {
                    debug!(
                        status = %response.status(),
                        event_type = %event.event_type,
                        "peer rejected event, requeueing"
                    );
                    failed.push((event, meta.retry_count + 1));
                }
                Err(err) => {
                    debug!(
                        event_type = %event.event_type,
                        "delivery failed, requeueing: {err}"
                    );
                    failed.push((event, meta.retry_count + 1));
                }
            }
        }

        for (event, retry_count) in failed {
            let _ = ctx.outgoing().append_with_retry(event, retry_count);
        }

        control.loop_end().await;
    }
    debug!("send_event loop ended");
}
