//! evbus: a reusable message-bus node runtime.
//!
//! Each node accepts HTTP-delivered events from peers, classifies them
//! through a user-installed behavior, tracks in-flight requests, and
//! reliably forwards outgoing events (including replies) with retry.  This
//! crate re-exports the public surface of the member crates; the
//! integration suites under `tests/integration/` exercise whole nodes
//! end to end.

pub use evbus_core::{ControlLoop, EventMetadata, EventPool, OverflowPolicy, PoolError, PoolStats};
pub use evbus_protocol::{
    DEFAULT_MAXIMUM_PROCESSING_TIME, Event, EventResult, RESULT_ERROR, RESULT_FAILURE,
    RESULT_SUCCESS, RESULT_TEST_FAILED, timestamp_key,
};
pub use listener::{
    DefaultBehavior, EventListener, ListenerOptions, ListenerState, NodeBehavior, NodeContext,
    ReplyError, Snapshot, SnapshotError, StartError,
};
