//! Crash-safe JSON persistence for the node's pools, state and configuration.
//!
//! # Snapshot layout
//! `<state_dir>/<name>_state.json`:
//! ```json
//! {
//!   "incoming_events":   [ Event, ... ],
//!   "processing_events": [ Event, ... ],
//!   "events_to_send":    [ Event, ... ],
//!   "state":             { ... }
//! }
//! ```
//! Outgoing retry counters are intentionally not persisted; a restarted node
//! treats every pending outgoing event as fresh.
//!
//! # Atomicity
//! Writes land in a sibling `.tmp` file and are renamed into place, so a
//! crash mid-write leaves either the old snapshot or none — never a torn one.
//! Readers treat a missing file as "nothing to restore" and a malformed file
//! as a warning plus an empty start; durability here is best effort, peers
//! must stay idempotent regardless.

use std::io::ErrorKind;
use std::path::Path;

use evbus_protocol::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// On-disk form of the three pools plus the application state.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub incoming_events: Vec<Event>,
    #[serde(default)]
    pub processing_events: Vec<Event>,
    #[serde(default)]
    pub events_to_send: Vec<Event>,
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.incoming_events.is_empty()
            && self.processing_events.is_empty()
            && self.events_to_send.is_empty()
            && self.state.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Snapshot read/write
// ---------------------------------------------------------------------------

/// Write the snapshot; returns `Ok(false)` when everything was empty and the
/// write was skipped.
pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<bool, SnapshotError> {
    if snapshot.is_empty() {
        debug!("queues and state are empty, skipping snapshot");
        return Ok(false);
    }
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &bytes)?;
    Ok(true)
}

/// Read a snapshot; `Ok(None)` when no file exists.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    match std::fs::read(path) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    }
}

// ---------------------------------------------------------------------------
// Configuration read/write
// ---------------------------------------------------------------------------

/// Write the user configuration; returns `Ok(false)` when it is empty and
/// the write was skipped.
pub fn save_config(path: &Path, config: &Map<String, Value>) -> Result<bool, SnapshotError> {
    if config.is_empty() {
        debug!("configuration is empty, skipping write");
        return Ok(false);
    }
    let bytes = serde_json::to_vec_pretty(config)?;
    write_atomic(path, &bytes)?;
    Ok(true)
}

/// Read the user configuration; `Ok(None)` when no file exists.
pub fn load_config(path: &Path) -> Result<Option<Map<String, Value>>, SnapshotError> {
    match std::fs::read(path) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
    }
}

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
