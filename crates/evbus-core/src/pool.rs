//! Thread-safe event pools keyed by event timestamp.
//!
//! A node owns three pools — incoming, processing, outgoing — all instances
//! of the same `EventPool` with different capacity, age and retry settings.
//! Entries keep insertion order, so `pop_oldest` is FIFO and a timestamp
//! lookup is O(1).
//!
//! # Locking discipline
//! All state lives behind one mutex per pool.  Public methods lock exactly
//! once; batch operations (`extend`, `pop_batch`, `pop_batch_grouped`) hold
//! the lock for the whole batch so the batch is atomic.  Nothing blocking
//! runs under the lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::NaiveDateTime;
use evbus_protocol::Event;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What `append` does when the pool is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest entry, then admit the new one.
    DropOldest,
    /// Reject the new entry.
    DropNewest,
    /// Fail the caller.
    RaiseError,
    /// No capacity check.
    Unlimited,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop_oldest",
            OverflowPolicy::DropNewest => "drop_newest",
            OverflowPolicy::RaiseError => "raise_error",
            OverflowPolicy::Unlimited => "unlimited",
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{pool}: pool overflow (max_size={max_size})")]
    Overflow { pool: String, max_size: usize },
}

/// An event plus its pool bookkeeping.
#[derive(Debug, Clone)]
pub struct EventMetadata {
    pub event: Event,
    /// When the entry was admitted (wall clock, local naive time — the same
    /// clock event timestamps use).
    pub added_at: NaiveDateTime,
    /// Delivery attempts that have failed so far (outgoing pool only).
    pub retry_count: u32,
    pub priority: i32,
    /// Free-form per-entry annotations, e.g. `last_retry_at`.
    pub metadata: Map<String, Value>,
}

impl EventMetadata {
    fn new(event: Event, retry_count: u32, priority: i32, metadata: Map<String, Value>) -> Self {
        EventMetadata {
            event,
            added_at: wall_now(),
            retry_count,
            priority,
            metadata,
        }
    }

    /// Seconds since the entry was admitted.
    pub fn age_seconds(&self) -> f64 {
        let delta = wall_now().signed_duration_since(self.added_at);
        delta
            .num_microseconds()
            .map_or(f64::MAX, |us| us as f64 / 1_000_000.0)
    }

    /// The entry's pool key.
    pub fn timestamp_key(&self) -> String {
        self.event.timestamp_key()
    }
}

/// Snapshot of a pool's counters and shape.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub max_size: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub oldest_added_at: Option<NaiveDateTime>,
    pub newest_added_at: Option<NaiveDateTime>,
    pub avg_age_seconds: f64,
    pub total_added: u64,
    pub total_removed: u64,
    pub total_dropped: u64,
}

fn wall_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

// ---------------------------------------------------------------------------
// EventPool
// ---------------------------------------------------------------------------

struct PoolInner {
    entries: IndexMap<String, EventMetadata>,
    total_added: u64,
    total_removed: u64,
    total_dropped: u64,
}

/// Insertion-ordered pool of events keyed by event timestamp.
///
/// Duplicate timestamp keys are rejected rather than overwritten; when
/// `max_age_seconds` is set, stale entries are garbage-collected lazily on
/// the next mutation.
pub struct EventPool {
    name: String,
    max_size: Option<usize>,
    overflow_policy: OverflowPolicy,
    max_age_seconds: Option<f64>,
    /// Retry cap enforced by `increment_retry`; only the outgoing pool sets it.
    max_retries: Option<u32>,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("name", &self.name)
            .field("size", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl EventPool {
    pub fn new(
        name: impl Into<String>,
        max_size: Option<usize>,
        overflow_policy: OverflowPolicy,
        max_age_seconds: Option<f64>,
    ) -> Self {
        EventPool {
            name: name.into(),
            max_size,
            overflow_policy,
            max_age_seconds,
            max_retries: None,
            inner: Mutex::new(PoolInner {
                entries: IndexMap::new(),
                total_added: 0,
                total_removed: 0,
                total_dropped: 0,
            }),
        }
    }

    /// Pool for freshly ingested events awaiting classification.
    pub fn incoming(max_size: usize, max_age_seconds: f64) -> Self {
        EventPool::new(
            "incoming_events",
            Some(max_size),
            OverflowPolicy::DropOldest,
            Some(max_age_seconds),
        )
    }

    /// Pool for in-flight events awaiting completion.  Unlimited; stale
    /// entries age out at twice the default per-event deadline.
    pub fn processing(default_timeout_seconds: f64) -> Self {
        EventPool::new(
            "processing_events",
            None,
            OverflowPolicy::Unlimited,
            Some(default_timeout_seconds * 2.0),
        )
    }

    /// Pool for events waiting to be delivered to peers.
    pub fn outgoing(max_size: usize, max_age_seconds: f64, max_retries: u32) -> Self {
        let mut pool = EventPool::new(
            "events_to_send",
            Some(max_size),
            OverflowPolicy::DropOldest,
            Some(max_age_seconds),
        );
        pool.max_retries = Some(max_retries);
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// Add an event with default bookkeeping.
    ///
    /// Returns `Ok(false)` when the entry was rejected (duplicate key or
    /// `DropNewest` at capacity); fails only under `RaiseError`.
    pub fn append(&self, event: Event) -> Result<bool, PoolError> {
        self.append_full(event, 0, 0, None)
    }

    /// Add an event with an explicit retry counter, priority and annotations.
    pub fn append_full(
        &self,
        event: Event,
        retry_count: u32,
        priority: i32,
        metadata: Option<Map<String, Value>>,
    ) -> Result<bool, PoolError> {
        let mut inner = self.lock();
        self.append_inner(&mut inner, event, retry_count, priority, metadata)
    }

    /// Add an outgoing event carrying its retry counter.
    pub fn append_with_retry(&self, event: Event, retry_count: u32) -> Result<bool, PoolError> {
        let mut annotations = Map::new();
        annotations.insert("last_retry_at".to_owned(), Value::Null);
        self.append_full(event, retry_count, 0, Some(annotations))
    }

    /// Add a batch under a single lock acquisition.  Returns how many were
    /// admitted.  Under `DropNewest` the batch stops at the first rejection.
    pub fn extend(&self, events: Vec<Event>) -> Result<usize, PoolError> {
        let mut inner = self.lock();
        let mut added = 0;
        for event in events {
            if self.append_inner(&mut inner, event, 0, 0, None)? {
                added += 1;
            } else if self.overflow_policy == OverflowPolicy::DropNewest {
                break;
            }
        }
        Ok(added)
    }

    fn append_inner(
        &self,
        inner: &mut PoolInner,
        event: Event,
        retry_count: u32,
        priority: i32,
        metadata: Option<Map<String, Value>>,
    ) -> Result<bool, PoolError> {
        self.cleanup_old_inner(inner);

        if !self.admit_inner(inner)? {
            return Ok(false);
        }

        let key = event.timestamp_key();
        if inner.entries.contains_key(&key) {
            debug!(pool = %self.name, key = %key, "duplicate timestamp key, skipping");
            return Ok(false);
        }

        inner.entries.insert(
            key,
            EventMetadata::new(event, retry_count, priority, metadata.unwrap_or_default()),
        );
        inner.total_added += 1;
        Ok(true)
    }

    /// Apply the overflow policy; `Ok(true)` means the new entry may be added.
    fn admit_inner(&self, inner: &mut PoolInner) -> Result<bool, PoolError> {
        let Some(max_size) = self.max_size else {
            return Ok(true);
        };
        if inner.entries.len() < max_size {
            return Ok(true);
        }

        match self.overflow_policy {
            OverflowPolicy::DropOldest => {
                if inner.entries.shift_remove_index(0).is_some() {
                    inner.total_dropped += 1;
                    debug!(pool = %self.name, "dropped oldest event due to overflow");
                }
                Ok(true)
            }
            OverflowPolicy::DropNewest => {
                inner.total_dropped += 1;
                warn!(pool = %self.name, "dropped new event due to overflow");
                Ok(false)
            }
            OverflowPolicy::RaiseError => Err(PoolError::Overflow {
                pool: self.name.clone(),
                max_size,
            }),
            OverflowPolicy::Unlimited => Ok(true),
        }
    }

    fn cleanup_old_inner(&self, inner: &mut PoolInner) {
        let Some(max_age) = self.max_age_seconds else {
            return;
        };
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, meta)| meta.age_seconds() > max_age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            inner.entries.shift_remove(key);
            inner.total_removed += 1;
        }
        if !stale.is_empty() {
            debug!(pool = %self.name, count = stale.len(), "cleaned up old events");
        }
    }

    // -----------------------------------------------------------------------
    // Removal and lookup
    // -----------------------------------------------------------------------

    /// Remove and return the oldest entry (FIFO).
    pub fn pop_oldest(&self) -> Option<EventMetadata> {
        let mut inner = self.lock();
        let (_, meta) = inner.entries.shift_remove_index(0)?;
        inner.total_removed += 1;
        Some(meta)
    }

    /// Remove and return the entry with the given timestamp key.
    pub fn pop_by_timestamp(&self, key: &str) -> Option<EventMetadata> {
        let mut inner = self.lock();
        let meta = inner.entries.shift_remove(key)?;
        inner.total_removed += 1;
        Some(meta)
    }

    /// The oldest entry, without removing it.
    pub fn peek_oldest(&self) -> Option<EventMetadata> {
        let inner = self.lock();
        inner.entries.get_index(0).map(|(_, meta)| meta.clone())
    }

    /// Look up an entry by timestamp key, without removing it.
    pub fn get_by_timestamp(&self, key: &str) -> Option<EventMetadata> {
        self.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Remove and return up to `batch_size` oldest entries, in order.
    pub fn pop_batch(&self, batch_size: usize) -> Vec<EventMetadata> {
        let mut inner = self.lock();
        let count = batch_size.min(inner.entries.len());
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            match inner.entries.shift_remove_index(0) {
                Some((_, meta)) => {
                    inner.total_removed += 1;
                    batch.push(meta);
                }
                None => break,
            }
        }
        batch
    }

    // -----------------------------------------------------------------------
    // Predicates and snapshots
    // -----------------------------------------------------------------------

    /// Entries matching the predicate, in insertion order.
    pub fn filter(&self, predicate: impl Fn(&EventMetadata) -> bool) -> Vec<EventMetadata> {
        self.lock()
            .entries
            .values()
            .filter(|meta| predicate(meta))
            .cloned()
            .collect()
    }

    /// Remove entries matching the predicate; returns how many were removed.
    pub fn remove_if(&self, predicate: impl Fn(&EventMetadata) -> bool) -> usize {
        let mut inner = self.lock();
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, meta)| predicate(meta))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.entries.shift_remove(key);
            inner.total_removed += 1;
        }
        doomed.len()
    }

    /// A consistent copy of all entries, in insertion order.
    pub fn snapshot(&self) -> Vec<EventMetadata> {
        self.lock().entries.values().cloned().collect()
    }

    /// All timestamp keys, in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Drop every entry; returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.total_removed += count as u64;
        count
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        let oldest = inner.entries.first().map(|(_, m)| m.added_at);
        let newest = inner.entries.last().map(|(_, m)| m.added_at);
        let avg_age_seconds = if inner.entries.is_empty() {
            0.0
        } else {
            inner.entries.values().map(EventMetadata::age_seconds).sum::<f64>()
                / inner.entries.len() as f64
        };
        PoolStats {
            name: self.name.clone(),
            size: inner.entries.len(),
            max_size: self.max_size,
            overflow_policy: self.overflow_policy,
            oldest_added_at: oldest,
            newest_added_at: newest,
            avg_age_seconds,
            total_added: inner.total_added,
            total_removed: inner.total_removed,
            total_dropped: inner.total_dropped,
        }
    }

    // -----------------------------------------------------------------------
    // Outgoing pool: retries and destination grouping
    // -----------------------------------------------------------------------

    /// Bump the retry counter for an entry.
    ///
    /// Returns the updated entry while retries remain.  When the counter
    /// reaches the pool's retry cap the entry is removed and `None` is
    /// returned.
    pub fn increment_retry(&self, key: &str) -> Option<EventMetadata> {
        let mut inner = self.lock();
        let new_count = {
            let meta = inner.entries.get_mut(key)?;
            meta.retry_count += 1;
            meta.metadata.insert(
                "last_retry_at".to_owned(),
                Value::String(evbus_protocol::timestamp_key(&wall_now())),
            );
            meta.retry_count
        };

        if let Some(max_retries) = self.max_retries {
            if new_count >= max_retries {
                inner.entries.shift_remove(key);
                inner.total_removed += 1;
                error!(
                    pool = %self.name,
                    key = %key,
                    max_retries,
                    "event dropped after exhausting retries"
                );
                return None;
            }
        }
        inner.entries.get(key).cloned()
    }

    /// All entries grouped by `(destination_address, destination_port)`,
    /// non-destructively.  Order within each group is insertion order.
    pub fn group_by_destination(&self) -> HashMap<(String, u16), Vec<EventMetadata>> {
        let inner = self.lock();
        let mut groups: HashMap<(String, u16), Vec<EventMetadata>> = HashMap::new();
        for meta in inner.entries.values() {
            let key = (
                meta.event.destination_address.clone(),
                meta.event.destination_port,
            );
            groups.entry(key).or_default().push(meta.clone());
        }
        groups
    }

    /// Remove up to `batch_size` oldest entries and return them grouped by
    /// destination.  One lock acquisition for the whole batch.
    pub fn pop_batch_grouped(
        &self,
        batch_size: usize,
    ) -> HashMap<(String, u16), Vec<EventMetadata>> {
        let mut inner = self.lock();
        let count = batch_size.min(inner.entries.len());
        let mut groups: HashMap<(String, u16), Vec<EventMetadata>> = HashMap::new();
        for _ in 0..count {
            let Some((_, meta)) = inner.entries.shift_remove_index(0) else {
                break;
            };
            inner.total_removed += 1;
            let key = (
                meta.event.destination_address.clone(),
                meta.event.destination_port,
            );
            groups.entry(key).or_default().push(meta);
        }
        groups
    }

    // -----------------------------------------------------------------------
    // Processing pool: deadline tracking
    // -----------------------------------------------------------------------

    /// Entries whose age exceeds their own `maximum_processing_time`.
    pub fn timed_out_events(&self) -> Vec<EventMetadata> {
        self.filter(has_timed_out)
    }

    /// Remove entries whose age exceeds their own `maximum_processing_time`.
    pub fn cleanup_timed_out(&self) -> usize {
        let count = self.remove_if(has_timed_out);
        if count > 0 {
            warn!(pool = %self.name, count, "removed timed-out events");
        }
        count
    }
}

fn has_timed_out(meta: &EventMetadata) -> bool {
    match meta.event.maximum_processing_time {
        Some(limit) if limit > 0.0 => meta.age_seconds() > limit,
        _ => false,
    }
}
