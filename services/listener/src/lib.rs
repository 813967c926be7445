//! The listener runtime: the common node underlying every service on the
//! event bus.
//!
//! A node is built from [`ListenerOptions`] plus a [`NodeBehavior`]
//! implementation; the runtime supplies the HTTP ingress, the three event
//! pools and their loops, the retrying dispatcher, and crash-safe
//! persistence of queues and configuration.

pub mod config;
pub mod dispatcher;
pub mod hooks;
pub mod ingress;
pub mod listener;
pub mod persistence;

pub use config::ListenerOptions;
pub use hooks::{DefaultBehavior, NodeBehavior};
pub use listener::{EventListener, ListenerState, NodeContext, ReplyError, StartError};
pub use persistence::{Snapshot, SnapshotError};
