//! The behavior hook surface.
//!
//! A node's application policy lives behind `NodeBehavior`.  The runtime
//! calls the hooks from its loops and the ingress; the hooks drive domain
//! work through the helper methods on [`NodeContext`]
//! (`emit`, `add_to_processing`, `find_and_remove_processing_event`,
//! `reply`).  Every method has a default, so a bare node runs with no
//! behavior installed at all.

use async_trait::async_trait;
use evbus_protocol::Event;

use crate::listener::NodeContext;

/// Application policy hooks, called by the listener runtime.
///
/// Hooks must keep each invocation bounded: the loops check the shutdown
/// flag only between iterations.  A panic inside a hook is contained and
/// logged; it never takes the loop down.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    /// Called once per event drained from the incoming pool.
    ///
    /// Return `true` to drop the event from the incoming pool, `false` to
    /// keep it there for reconsideration on a later tick.  Move work
    /// forward by calling `node.add_to_processing` and/or `node.emit`.
    async fn analyze_event(&self, node: &NodeContext, event: &Event) -> bool {
        let _ = (node, event);
        true
    }

    /// Called once per local-data tick while the node is running.
    ///
    /// Poll domain state here; complete requests with
    /// `node.find_and_remove_processing_event` + `node.reply`.
    async fn check_local_data(&self, node: &NodeContext) {
        let _ = node;
    }

    /// Called for each `POST /state` body.
    async fn on_state(&self, node: &NodeContext, event: Event) {
        let _ = (node, event);
    }

    /// Called for each `POST /discovery` body.
    async fn on_discovery(&self, node: &NodeContext, event: Event) {
        let _ = (node, event);
    }

    /// Best-effort finalisation, invoked during shutdown after the loops
    /// have stopped and state has been flushed.
    async fn before_shutdown(&self, node: &NodeContext) {
        let _ = node;
    }
}

/// The no-op behavior: every incoming event is analyzed and dropped.
#[derive(Debug, Default)]
pub struct DefaultBehavior;

#[async_trait]
impl NodeBehavior for DefaultBehavior {}
