// evbus-protocol: event bus wire types and serialization.
//
// Every message exchanged between nodes is a single `Event` posted as JSON
// to a peer's `/event` endpoint.  The field set is frozen; unknown fields
// are rejected at the boundary so that a misaddressed or corrupted payload
// fails loudly instead of being half-parsed.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// EventResult
// ---------------------------------------------------------------------------

/// Outcome attached to an event before a reply is emitted.
///
/// All fields are optional so both plain successes and rich failures fit the
/// same shape.  The `result` tag is free-form, but peers conventionally use
/// the constants below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Conventional `result` tag: the request completed.
pub const RESULT_SUCCESS: &str = "success";
/// Conventional `result` tag: the request was understood but did not complete.
pub const RESULT_FAILURE: &str = "failure";
/// Conventional `result` tag: a self-test or probe failed.
pub const RESULT_TEST_FAILED: &str = "test_failed";
/// Conventional `result` tag: the handler hit an internal error.
pub const RESULT_ERROR: &str = "error";

impl EventResult {
    pub fn success() -> Self {
        EventResult {
            result: Some(RESULT_SUCCESS.to_owned()),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failure() -> Self {
        EventResult {
            result: Some(RESULT_FAILURE.to_owned()),
            error_code: None,
            error_message: None,
        }
    }

    pub fn test_failed() -> Self {
        EventResult {
            result: Some(RESULT_TEST_FAILED.to_owned()),
            error_code: None,
            error_message: None,
        }
    }

    /// An internal-error result carrying a code and message.
    pub fn error(error_code: i64, error_message: impl Into<String>) -> Self {
        EventResult {
            result: Some(RESULT_ERROR.to_owned()),
            error_code: Some(error_code),
            error_message: Some(error_message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The unit of communication between nodes.
///
/// An event is self-addressed: it carries both the logical names and the
/// concrete HTTP endpoints of its sender and recipient, so any node holding
/// the event can deliver it (or a reply) without a routing table.
///
/// `timestamp` is set once at construction and never rewritten; it doubles
/// as the event's identity key inside the node-local pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    /// Logical name of the sending node.
    pub source: String,
    /// Sender address at the moment of emission.
    pub source_address: String,
    /// Sender HTTP port.
    pub source_port: u16,
    /// Logical name of the recipient node.
    pub destination: String,
    pub destination_address: String,
    pub destination_port: u16,
    /// Free-form tag interpreted by the receiving node's behavior hook.
    pub event_type: String,
    /// ISO-8601 with sub-second precision on the wire.
    #[serde(default = "now")]
    pub timestamp: NaiveDateTime,
    /// Opaque payload; the core passes it through untouched.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Multiplicity / weighting; always ≥ 1.
    #[serde(default = "default_payload")]
    pub payload: u32,
    /// Caller-supplied correlation token.
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub result: Option<EventResult>,
    /// Sender hint: the recipient is expected to move this into processing
    /// and reply later.
    #[serde(default)]
    pub to_be_processed: bool,
    /// Set by the receiving node when the event enters its processing pool.
    /// Not meaningful on the wire.
    #[serde(default)]
    pub is_processing: bool,
    /// Hint for batched replies.
    #[serde(default)]
    pub is_cumulative: bool,
    /// Per-event deadline in seconds; the node substitutes its configured
    /// default when unset.
    #[serde(default)]
    pub maximum_processing_time: Option<f64>,
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn default_payload() -> u32 {
    1
}

impl Event {
    /// Construct an event addressed from `source` to `destination`, stamped
    /// with the current local time.
    ///
    /// Flags default to false, `payload` to 1, and `maximum_processing_time`
    /// to 20 s — the same defaults a bare wire event gets, except the
    /// deadline, which a constructed event always carries.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: impl Into<String>,
        source_address: impl Into<String>,
        source_port: u16,
        destination: impl Into<String>,
        destination_address: impl Into<String>,
        destination_port: u16,
        event_type: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Event {
            source: source.into(),
            source_address: source_address.into(),
            source_port,
            destination: destination.into(),
            destination_address: destination_address.into(),
            destination_port,
            event_type: event_type.into(),
            timestamp: now(),
            data,
            payload: 1,
            id: None,
            result: None,
            to_be_processed: false,
            is_processing: false,
            is_cumulative: false,
            maximum_processing_time: Some(DEFAULT_MAXIMUM_PROCESSING_TIME),
        }
    }

    /// The pool key for this event: its timestamp at fixed microsecond
    /// precision.  Two events constructed in the same microsecond collide,
    /// which the pools treat as a duplicate.
    pub fn timestamp_key(&self) -> String {
        timestamp_key(&self.timestamp)
    }

    /// Build the reply to this event: endpoints swapped, everything else
    /// (timestamp, id, data, result) carried over.
    ///
    /// Callers are expected to set `result` first; the listener's reply
    /// helper enforces that.
    pub fn into_reply(self) -> Event {
        Event {
            source: self.destination,
            source_address: self.destination_address,
            source_port: self.destination_port,
            destination: self.source,
            destination_address: self.source_address,
            destination_port: self.source_port,
            event_type: self.event_type,
            timestamp: self.timestamp,
            data: self.data,
            payload: self.payload,
            id: self.id,
            result: self.result,
            to_be_processed: self.to_be_processed,
            is_processing: self.is_processing,
            is_cumulative: self.is_cumulative,
            maximum_processing_time: self.maximum_processing_time,
        }
    }
}

/// Default per-event deadline in seconds.
pub const DEFAULT_MAXIMUM_PROCESSING_TIME: f64 = 20.0;

/// Render a timestamp as a pool key.
///
/// Fixed six-digit fraction so keys computed from equal timestamps are
/// always byte-equal regardless of trailing zeros.
pub fn timestamp_key(timestamp: &NaiveDateTime) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
