//! The listener runtime: pools, loops, lifecycle and the helper surface
//! behaviors program against.
//!
//! One `EventListener` is one node.  Construction loads persisted
//! configuration and (unless told otherwise) rehydrates the pools from the
//! last shutdown snapshot.  `start` binds the HTTP ingress, releases the
//! periodic loops after a short stabilization window, and serves until
//! `shutdown` — which is idempotent and also wired to SIGINT/SIGTERM.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::NaiveDateTime;
use evbus_core::{ControlLoop, EventPool};
use evbus_protocol::Event;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ListenerOptions;
use crate::dispatcher;
use crate::hooks::NodeBehavior;
use crate::ingress;
use crate::persistence::{self, Snapshot};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Initialized,
    Running,
    Error,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply requires event.result to be set")]
    MissingResult,
}

// ---------------------------------------------------------------------------
// NodeContext — shared node state and the behavior helper surface
// ---------------------------------------------------------------------------

/// Shared state of one node: the three pools, counters, application state
/// and configuration.  Behaviors receive `&NodeContext` and drive the node
/// exclusively through it.
pub struct NodeContext {
    options: ListenerOptions,
    incoming: EventPool,
    processing: EventPool,
    outgoing: EventPool,
    state: Mutex<Map<String, Value>>,
    configuration: Mutex<Map<String, Value>>,
    lifecycle: RwLock<ListenerState>,
    shutdown_requested: AtomicBool,
    received_events: AtomicU64,
    sent_events: AtomicU64,
    received_per_second: AtomicU64,
    sent_per_second: AtomicU64,
    /// OVERTIME diagnostics emitted for in-flight events.
    overtime_events: AtomicU64,
    /// Outgoing events dropped after exhausting their retries.
    pub(crate) retry_exhausted_events: AtomicU64,
    pub(crate) analyzer_overtime: Arc<AtomicU64>,
    pub(crate) check_local_overtime: Arc<AtomicU64>,
    pub(crate) dispatcher_overtime: Arc<AtomicU64>,
}

impl NodeContext {
    fn new(options: ListenerOptions) -> Self {
        let incoming = EventPool::incoming(
            options.incoming_max_size,
            options.incoming_max_age_seconds,
        );
        let processing = EventPool::processing(options.default_max_processing_time);
        let outgoing = EventPool::outgoing(
            options.outgoing_max_size,
            options.outgoing_max_age_seconds,
            options.max_retries,
        );
        NodeContext {
            options,
            incoming,
            processing,
            outgoing,
            state: Mutex::new(Map::new()),
            configuration: Mutex::new(Map::new()),
            lifecycle: RwLock::new(ListenerState::Idle),
            shutdown_requested: AtomicBool::new(false),
            received_events: AtomicU64::new(0),
            sent_events: AtomicU64::new(0),
            received_per_second: AtomicU64::new(0),
            sent_per_second: AtomicU64::new(0),
            overtime_events: AtomicU64::new(0),
            retry_exhausted_events: AtomicU64::new(0),
            analyzer_overtime: Arc::new(AtomicU64::new(0)),
            check_local_overtime: Arc::new(AtomicU64::new(0)),
            dispatcher_overtime: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn address(&self) -> &str {
        &self.options.address
    }

    pub fn port(&self) -> u16 {
        self.options.port
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn incoming(&self) -> &EventPool {
        &self.incoming
    }

    pub fn processing(&self) -> &EventPool {
        &self.processing
    }

    pub fn outgoing(&self) -> &EventPool {
        &self.outgoing
    }

    /// The behavior-owned application state, persisted across restarts.
    ///
    /// Do not hold the guard across an await point.
    pub fn state(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The persisted user configuration.
    pub fn configuration(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.configuration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lifecycle(&self) -> ListenerState {
        *self
            .lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, state: ListenerState) {
        *self
            .lifecycle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn received_events(&self) -> u64 {
        self.received_events.load(Ordering::Relaxed)
    }

    pub fn sent_events(&self) -> u64 {
        self.sent_events.load(Ordering::Relaxed)
    }

    /// Received-event throughput over the last sampled second.
    pub fn received_events_per_second(&self) -> u64 {
        self.received_per_second.load(Ordering::Relaxed)
    }

    /// Sent-event throughput over the last sampled second.
    pub fn sent_events_per_second(&self) -> u64 {
        self.sent_per_second.load(Ordering::Relaxed)
    }

    /// How many OVERTIME diagnostics have been emitted for in-flight events.
    pub fn overtime_events(&self) -> u64 {
        self.overtime_events.load(Ordering::Relaxed)
    }

    /// How many outgoing events were dropped after exhausting retries.
    pub fn retry_exhausted_events(&self) -> u64 {
        self.retry_exhausted_events.load(Ordering::Relaxed)
    }

    /// Total control-loop overtime iterations across all loops.
    pub fn loop_overtime_total(&self) -> u64 {
        self.analyzer_overtime.load(Ordering::Relaxed)
            + self.check_local_overtime.load(Ordering::Relaxed)
            + self.dispatcher_overtime.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_received(&self) {
        self.received_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bump_sent(&self) {
        self.sent_events.fetch_add(1, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Behavior helpers
    // -----------------------------------------------------------------------

    /// Construct an event from this node's identity and queue it for
    /// delivery with a fresh retry counter.
    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        destination: &str,
        destination_address: &str,
        destination_port: u16,
        event_type: &str,
        id: Option<i64>,
        data: Map<String, Value>,
        to_be_processed: bool,
        maximum_processing_time: Option<f64>,
    ) -> Event {
        let mut event = Event::new(
            self.options.name.clone(),
            self.options.address.clone(),
            self.options.port,
            destination,
            destination_address,
            destination_port,
            event_type,
            data,
        );
        event.id = id;
        event.to_be_processed = to_be_processed;
        event.maximum_processing_time = Some(
            maximum_processing_time.unwrap_or(self.options.default_max_processing_time),
        );

        match self.outgoing.append_with_retry(event.clone(), 0) {
            Ok(true) => {}
            Ok(false) => warn!(
                event_type = %event.event_type,
                "emitted event rejected by outgoing pool"
            ),
            Err(err) => error!(event_type = %event.event_type, "emit failed: {err}"),
        }
        event
    }

    /// Mark an event as in flight and insert it into the processing pool.
    pub fn add_to_processing(&self, mut event: Event) -> bool {
        event.is_processing = true;
        debug!(
            id = ?event.id,
            event_type = %event.event_type,
            deadline = ?event.maximum_processing_time,
            "event added to processing"
        );
        match self.processing.append(event) {
            Ok(added) => added,
            Err(err) => {
                error!("failed to add event to processing pool: {err}");
                false
            }
        }
    }

    /// Find the first processing-pool entry matching `event_type` (and,
    /// when given, `id` and the exact `timestamp`), remove it and return it.
    ///
    /// Emits an `OVERTIME` diagnostic when the event sat in flight past its
    /// deadline; the event is returned either way — whether to still reply
    /// is the behavior's call.
    pub fn find_and_remove_processing_event(
        &self,
        event_type: &str,
        id: Option<i64>,
        timestamp: Option<NaiveDateTime>,
    ) -> Option<Event> {
        debug!(
            event_type,
            ?id,
            ?timestamp,
            "searching processing pool for completed event"
        );
        let matched = self
            .processing
            .filter(|meta| {
                meta.event.event_type == event_type
                    && id.is_none_or(|id| meta.event.id == Some(id))
                    && timestamp.is_none_or(|ts| meta.event.timestamp == ts)
            })
            .into_iter()
            .next();

        let Some(matched) = matched else {
            error!(event_type, ?id, ?timestamp, "event not found in processing pool");
            return None;
        };
        let meta = self.processing.pop_by_timestamp(&matched.timestamp_key())?;
        let event = meta.event;

        let processing_time = (chrono::Local::now().naive_local() - event.timestamp)
            .num_microseconds()
            .map_or(f64::MAX, |us| us as f64 / 1_000_000.0);
        let deadline = event
            .maximum_processing_time
            .unwrap_or(self.options.default_max_processing_time);
        if processing_time > deadline {
            self.overtime_events.fetch_add(1, Ordering::Relaxed);
            error!(
                source = %event.source,
                destination = %event.destination,
                event_type = %event.event_type,
                "OVERTIME: event removed from processing after {processing_time:.2}s (deadline {deadline:.2}s)"
            );
        } else {
            info!(
                source = %event.source,
                destination = %event.destination,
                event_type = %event.event_type,
                "event removed from processing after {processing_time:.2}s"
            );
        }
        Some(event)
    }

    /// Queue the reply to `event`: endpoints swapped, identity and result
    /// carried over.  Fails when no result has been attached.
    pub fn reply(&self, event: Event) -> Result<(), ReplyError> {
        if event.result.is_none() {
            return Err(ReplyError::MissingResult);
        }
        let reply = event.into_reply();
        debug!(
            destination = %reply.destination,
            event_type = %reply.event_type,
            "reply queued for delivery"
        );
        match self.outgoing.append_with_retry(reply, 0) {
            Ok(_) => Ok(()),
            Err(err) => {
                error!("failed to queue reply: {err}");
                Ok(())
            }
        }
    }

    /// Reply to each event in turn.
    pub fn cumulative_reply(&self, events: Vec<Event>) -> Result<(), ReplyError> {
        for event in events {
            self.reply(event)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("name", &self.options.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventListener
// ---------------------------------------------------------------------------

/// One node: the runtime wrapper around [`NodeContext`] plus its loops and
/// HTTP server.
pub struct EventListener {
    ctx: Arc<NodeContext>,
    behavior: Arc<dyn NodeBehavior>,
    system_ready_tx: watch::Sender<bool>,
    system_ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    loop_handles: Mutex<VecDeque<(&'static str, JoinHandle<()>)>>,
    local_addr: Mutex<Option<SocketAddr>>,
    state_path: PathBuf,
    config_path: PathBuf,
}

impl EventListener {
    /// Construct a node: load persisted configuration, rehydrate the pools
    /// from the last snapshot unless `do_not_load_state`, and land in
    /// `Initialized`.
    pub fn new(options: ListenerOptions, behavior: Arc<dyn NodeBehavior>) -> Self {
        info!(
            name = %options.name,
            address = %options.address,
            port = options.port,
            "initializing event listener"
        );
        let state_path = options.state_file_path();
        let config_path = options.config_file_path();
        let do_not_load_state = options.do_not_load_state;
        let ctx = Arc::new(NodeContext::new(options));

        load_configuration(&ctx, &config_path);
        if !do_not_load_state {
            load_queues(&ctx, &state_path);
        }

        let (system_ready_tx, system_ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        ctx.set_lifecycle(ListenerState::Initialized);
        info!(name = %ctx.name(), "event listener initialized");

        EventListener {
            ctx,
            behavior,
            system_ready_tx,
            system_ready_rx,
            shutdown_tx,
            shutdown_rx,
            loop_handles: Mutex::new(VecDeque::new()),
            local_addr: Mutex::new(None),
            state_path,
            config_path,
        }
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// The actual bound address, available once `start` has bound the
    /// ingress socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The ingress router, exposed so tests can serve it on a port of
    /// their own choosing.
    pub fn router(&self) -> axum::Router {
        ingress::build_router(self.ctx.clone(), self.behavior.clone())
    }

    /// Bind the ingress, release the loops after the stabilization window,
    /// and serve until shutdown.
    pub async fn start(self: Arc<Self>) -> Result<(), StartError> {
        let bind_addr = format!("{}:{}", self.ctx.address(), self.ctx.port());
        info!(name = %self.ctx.name(), addr = %bind_addr, "starting listener");

        let tcp = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| {
                self.ctx.set_lifecycle(ListenerState::Error);
                StartError::Bind {
                    addr: bind_addr.clone(),
                    source,
                }
            })?;
        if let Ok(addr) = tcp.local_addr() {
            *self
                .local_addr
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(addr);
        }

        self.spawn_loops();
        {
            let listener = self.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("signal received, starting graceful shutdown");
                listener.shutdown().await;
            });
        }

        // Release the processing loops only after the server has had a
        // moment to stabilize.
        let ready_tx = self.system_ready_tx.clone();
        let ctx = self.ctx.clone();
        let stabilization = self.ctx.options().stabilization;
        tokio::spawn(async move {
            tokio::time::sleep(stabilization).await;
            ctx.set_lifecycle(ListenerState::Running);
            let _ = ready_tx.send(true);
            info!(name = %ctx.name(), "system stabilized, processing loops released");
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        let router = self.router();
        axum::serve(tcp, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|requested| *requested).await;
            })
            .await
            .map_err(StartError::Serve)?;

        info!(name = %self.ctx.name(), "listener stopped");
        Ok(())
    }

    /// Graceful shutdown: stop the loops, flush state and configuration,
    /// run the behavior's finalisation, stop the server.  Idempotent and
    /// safe to call from any task.
    pub async fn shutdown(&self) -> bool {
        if self.ctx.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!(name = %self.ctx.name(), "shutdown already requested");
            let _ = self.shutdown_tx.send(true);
            return true;
        }
        info!(name = %self.ctx.name(), "shutting down listener");
        let _ = self.shutdown_tx.send(true);

        // Give the loops time to observe the flag and finish the iteration
        // they are in.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let handles: Vec<_> = {
            let mut guard = self
                .loop_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for (loop_name, handle) in handles {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(_) => debug!(loop_name, "loop stopped"),
                Err(_) => error!(loop_name, "loop did not terminate within timeout"),
            }
        }

        self.save_queues();
        self.save_configuration();

        if AssertUnwindSafe(self.behavior.before_shutdown(&self.ctx))
            .catch_unwind()
            .await
            .is_err()
        {
            error!("before_shutdown hook panicked");
        }

        info!(name = %self.ctx.name(), "listener closed");
        true
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn spawn_loops(&self) {
        let mut handles = self
            .loop_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let options = self.ctx.options().clone();

        info!("starting analysis");
        handles.push_back((
            "analyze_queues",
            tokio::spawn(analyzer_loop(
                self.ctx.clone(),
                self.behavior.clone(),
                self.system_ready_rx.clone(),
                options.analyze_queue_frequency,
                options.report_overtime,
            )),
        ));

        info!("starting local data check");
        handles.push_back((
            "check_local_data",
            tokio::spawn(check_local_data_loop(
                self.ctx.clone(),
                self.behavior.clone(),
                self.system_ready_rx.clone(),
                options.check_local_data_frequency,
                options.report_overtime,
            )),
        ));

        info!("starting send_event");
        handles.push_back((
            "send_event",
            tokio::spawn(dispatcher::send_event_loop(
                self.ctx.clone(),
                self.system_ready_rx.clone(),
                options.send_queue_frequency,
                options.report_overtime,
                options.send_batch_size,
                options.max_retries,
            )),
        ));

        if options.discovery_neighbours {
            info!("starting discovery");
            handles.push_back((
                "discovery",
                tokio::spawn(discovery_loop(
                    self.ctx.clone(),
                    options.discovery_frequency,
                )),
            ));
        }
    }

    fn save_queues(&self) {
        let snapshot = Snapshot {
            incoming_events: self
                .ctx
                .incoming
                .snapshot()
                .into_iter()
                .map(|meta| meta.event)
                .collect(),
            processing_events: self
                .ctx
                .processing
                .snapshot()
                .into_iter()
                .map(|meta| meta.event)
                .collect(),
            events_to_send: self
                .ctx
                .outgoing
                .snapshot()
                .into_iter()
                .map(|meta| meta.event)
                .collect(),
            state: self.ctx.state().clone(),
        };
        match persistence::save_snapshot(&self.state_path, &snapshot) {
            Ok(true) => info!(path = %self.state_path.display(), "queues saved"),
            Ok(false) => {}
            Err(err) => error!("failed to save queues: {err}"),
        }
    }

    fn save_configuration(&self) {
        let configuration = self.ctx.configuration().clone();
        match persistence::save_config(&self.config_path, &configuration) {
            Ok(true) => info!(path = %self.config_path.display(), "configuration saved"),
            Ok(false) => {}
            Err(err) => error!("failed to save configuration: {err}"),
        }
    }
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("name", &self.ctx.name())
            .field("lifecycle", &self.ctx.lifecycle())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Startup loading
// ---------------------------------------------------------------------------

fn load_configuration(ctx: &NodeContext, path: &std::path::Path) {
    match persistence::load_config(path) {
        Ok(Some(config)) => {
            *ctx.configuration() = config;
            info!(path = %path.display(), "configuration loaded");
        }
        Ok(None) => {}
        Err(err) => warn!("failed to load configuration, starting empty: {err}"),
    }
}

fn load_queues(ctx: &NodeContext, path: &std::path::Path) {
    match persistence::load_snapshot(path) {
        Ok(Some(snapshot)) => {
            for event in snapshot.incoming_events {
                let _ = ctx.incoming.append(event);
            }
            for event in snapshot.processing_events {
                let _ = ctx.processing.append(event);
            }
            for event in snapshot.events_to_send {
                // Retry counters are not persisted; restarts start fresh.
                let _ = ctx.outgoing.append_with_retry(event, 0);
            }
            *ctx.state() = snapshot.state;
            info!(path = %path.display(), "queues loaded from snapshot");
            if let Err(err) = std::fs::remove_file(path) {
                warn!("failed to remove snapshot after load: {err}");
            } else {
                info!("snapshot file removed");
            }
        }
        Ok(None) => {}
        Err(err) => warn!("failed to load snapshot, starting with empty queues: {err}"),
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

pub(crate) fn period_of(frequency: f64) -> Duration {
    Duration::from_secs_f64(1.0 / frequency.max(f64::MIN_POSITIVE))
}

/// Park until `system_ready` fires.  Returns false when shutdown was
/// requested first.
pub(crate) async fn wait_until_ready(
    ctx: &NodeContext,
    ready: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        if ctx.shutdown_requested() {
            return false;
        }
        if *ready.borrow() {
            return true;
        }
        match tokio::time::timeout(Duration::from_millis(100), ready.changed()).await {
            Ok(Err(_)) => return false,
            Ok(Ok(())) | Err(_) => {}
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Drain the incoming pool and run each event through `analyze_event`.
/// Events the hook keeps (or fails on) go back to the pool in order.
async fn analyzer_loop(
    ctx: Arc<NodeContext>,
    behavior: Arc<dyn NodeBehavior>,
    mut ready: watch::Receiver<bool>,
    frequency: f64,
    report_overtime: bool,
) {
    debug!("starting analyze_queues loop");
    let mut control = ControlLoop::new("analyze_queues_loop", period_of(frequency), report_overtime)
        .with_overtime_sink(ctx.analyzer_overtime.clone());

    if !wait_until_ready(&ctx, &mut ready).await {
        debug!("analyze_queues loop cancelled during startup");
        return;
    }
    debug!("analyze_queues loop activated");

    while !ctx.shutdown_requested() {
        control.loop_begin();

        let batch = ctx.incoming.pop_batch(usize::MAX);
        if !batch.is_empty() {
            debug!(size = batch.len(), "analyzing incoming events queue");
        }
        let mut retained = Vec::new();
        for meta in batch {
            let event = meta.event;
            let verdict = AssertUnwindSafe(behavior.analyze_event(&ctx, &event))
                .catch_unwind()
                .await;
            match verdict {
                Ok(true) => {}
                Ok(false) => retained.push(event),
                Err(payload) => {
                    error!(
                        event_type = %event.event_type,
                        "analyze_event hook panicked: {}",
                        panic_message(payload.as_ref())
                    );
                    retained.push(event);
                }
            }
        }
        if !retained.is_empty() {
            let _ = ctx.incoming.extend(retained);
        }

        control.loop_end().await;
    }
    debug!("analyze_queues loop ended");
}

/// Tick the behavior's `check_local_data` and sample throughput once a
/// second, logging the queue-status line.
async fn check_local_data_loop(
    ctx: Arc<NodeContext>,
    behavior: Arc<dyn NodeBehavior>,
    mut ready: watch::Receiver<bool>,
    frequency: f64,
    report_overtime: bool,
) {
    debug!("starting check_local_data loop");
    let mut control =
        ControlLoop::new("check_local_data_loop", period_of(frequency), report_overtime)
            .with_overtime_sink(ctx.check_local_overtime.clone());

    if !wait_until_ready(&ctx, &mut ready).await {
        debug!("check_local_data loop cancelled during startup");
        return;
    }
    debug!("check_local_data loop activated");

    let ticks_per_second = (frequency.max(1.0)) as u64;
    let mut prev_received = ctx.received_events();
    let mut prev_sent = ctx.sent_events();

    while !ctx.shutdown_requested() {
        control.loop_begin();

        if ctx.lifecycle() == ListenerState::Running {
            if let Err(payload) = AssertUnwindSafe(behavior.check_local_data(&ctx))
                .catch_unwind()
                .await
            {
                error!(
                    "check_local_data hook panicked: {}",
                    panic_message(payload.as_ref())
                );
            }

            if control.loop_counter() % ticks_per_second == 0 {
                let received = ctx.received_events();
                let sent = ctx.sent_events();
                ctx.received_per_second
                    .store(received - prev_received, Ordering::Relaxed);
                ctx.sent_per_second
                    .store(sent - prev_sent, Ordering::Relaxed);
                prev_received = received;
                prev_sent = sent;

                let incoming = ctx.incoming.len();
                let processing = ctx.processing.len();
                let outgoing = ctx.outgoing.len();
                if incoming + processing + outgoing > 100 {
                    error!(
                        "{} - queue status: incoming={} processing={} outgoing={} [in={} out={}] msgs/s",
                        ctx.name(),
                        incoming,
                        processing,
                        outgoing,
                        ctx.received_events_per_second(),
                        ctx.sent_events_per_second(),
                    );
                } else {
                    info!(
                        "{} - queue status: incoming={} processing={} outgoing={} [in={} out={}] msgs/s",
                        ctx.name(),
                        incoming,
                        processing,
                        outgoing,
                        ctx.received_events_per_second(),
                        ctx.sent_events_per_second(),
                    );
                }
            }
        }

        control.loop_end().await;
    }
    debug!("check_local_data loop ended");
}

/// Neighbour discovery tick.  The body is the extension point; a bare node
/// only keeps the cadence.
async fn discovery_loop(ctx: Arc<NodeContext>, frequency: f64) {
    debug!("starting discovery loop");
    let mut control = ControlLoop::new("discovery_loop", period_of(frequency), false);
    while !ctx.shutdown_requested() {
        control.loop_begin();
        control.loop_end().await;
    }
    debug!("discovery loop ended");
}

/// Resolves on SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
