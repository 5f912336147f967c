//! # Domain Types
//!
//! Records flowing through the pipeline, from caller input to the wire.
//!
//! ## Record Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Record Lifecycle                                │
//! │                                                                         │
//! │  EventDescription (caller)                                             │
//! │  ─────────────────────────                                             │
//! │  name: "Button Clicked"                                                │
//! │  properties: { "time": 1000, "color": "red" }                          │
//! │  token: "abc", automatic: false                                        │
//! │       │                                                                 │
//! │       │  to_wire(seq_no)   ← worker assigns the sequence number        │
//! │       ▼                                                                 │
//! │  WireEvent (persisted, then sent)                                      │
//! │  ────────────────────────────────                                      │
//! │  { "event": "button_clicked",                                          │
//! │    "ts": 1000,                                                         │
//! │    "payload": { "seq_no": 0, "time": 1000, "color": "red" } }          │
//! │       │                                                                 │
//! │       │  drained in id order                                           │
//! │       ▼                                                                 │
//! │  PersistedBatch { watermark, payload: "[...]", count }                 │
//! │       │                                                                 │
//! │       │  confirmed delivery                                            │
//! │       ▼                                                                 │
//! │  deleted up to watermark                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// Property key that overrides the ingestion timestamp.
pub const TIME_PROPERTY: &str = "time";

/// Payload key carrying the per-token sequence number.
pub const SEQ_NO_KEY: &str = "seq_no";

// =============================================================================
// Tables
// =============================================================================

/// The persistent queues a record can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Tracked events (caller and automatic).
    Events,
    /// Profile updates.
    People,
}

impl Table {
    /// Every table, in purge order.
    pub const ALL: [Table; 2] = [Table::Events, Table::People];

    /// SQL table name. Always a static identifier, never user input.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Events => "events",
            Table::People => "people",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Description
// =============================================================================

/// Lowercases a name and replaces spaces and hyphens with underscores.
///
/// ```rust
/// use tally_core::normalize_event_name;
/// assert_eq!(normalize_event_name("App Open-Screen"), "app_open_screen");
/// ```
pub fn normalize_event_name(name: &str) -> String {
    name.to_lowercase().replace([' ', '-'], "_")
}

/// A tracked event as handed over by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDescription {
    /// Raw event name (normalized when the wire record is built).
    pub name: String,

    /// Caller properties, kept in insertion order.
    pub properties: Map<String, Value>,

    /// Project token the event belongs to.
    pub token: String,

    /// True for SDK-generated events, false for caller-tracked ones.
    pub automatic: bool,

    /// Epoch milliseconds at which the event entered the pipeline.
    pub ingested_at_ms: i64,
}

impl EventDescription {
    /// Creates an event stamped with the current time.
    pub fn new(
        name: impl Into<String>,
        properties: Map<String, Value>,
        token: impl Into<String>,
        automatic: bool,
    ) -> Self {
        EventDescription {
            name: name.into(),
            properties,
            token: token.into(),
            automatic,
            ingested_at_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Overrides the ingestion time.
    pub fn with_ingestion_time(mut self, epoch_ms: i64) -> Self {
        self.ingested_at_ms = epoch_ms;
        self
    }

    /// The normalized event name.
    pub fn normalized_name(&self) -> String {
        normalize_event_name(&self.name)
    }

    /// Event time in epoch milliseconds.
    ///
    /// Taken from `properties["time"]` when it holds a number or a numeric
    /// string, otherwise the ingestion time.
    pub fn timestamp(&self) -> i64 {
        self.properties
            .get(TIME_PROPERTY)
            .and_then(time_property)
            .unwrap_or(self.ingested_at_ms)
    }

    /// Builds the wire record for the given sequence number.
    ///
    /// `seq_no` is written first; a caller property with the same key
    /// replaces its value.
    pub fn to_wire(&self, seq_no: i64) -> CoreResult<WireEvent> {
        if self.name.trim().is_empty() {
            return Err(CoreError::EmptyEventName);
        }

        let mut payload = Map::with_capacity(self.properties.len() + 1);
        payload.insert(SEQ_NO_KEY.to_string(), Value::from(seq_no));
        for (key, value) in &self.properties {
            payload.insert(key.clone(), value.clone());
        }

        Ok(WireEvent {
            event: self.normalized_name(),
            ts: self.timestamp(),
            payload,
        })
    }
}

fn time_property(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

// =============================================================================
// Wire Record
// =============================================================================

/// The persisted and transmitted event shape.
///
/// Field order is part of the collector contract:
/// `{"event": ..., "ts": ..., "payload": {"seq_no": ..., ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    pub ts: i64,
    pub payload: Map<String, Value>,
}

impl WireEvent {
    /// Serializes the record to its JSON string form.
    pub fn to_json_string(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The sequence number carried in the payload.
    pub fn seq_no(&self) -> Option<i64> {
        self.payload.get(SEQ_NO_KEY).and_then(Value::as_i64)
    }
}

// =============================================================================
// Profile Update
// =============================================================================

/// An opaque profile update, persisted verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileUpdate {
    pub payload: Value,
    pub token: String,
}

impl ProfileUpdate {
    pub fn new(payload: Value, token: impl Into<String>) -> Self {
        ProfileUpdate {
            payload,
            token: token.into(),
        }
    }

    /// Serializes the payload, rejecting anything that is not an object.
    pub fn to_record_string(&self) -> CoreResult<String> {
        match &self.payload {
            Value::Object(_) => Ok(serde_json::to_string(&self.payload)?),
            other => Err(CoreError::InvalidProfilePayload(json_kind(other).to_string())),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// Flush Request
// =============================================================================

/// Request to deliver everything queued for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushRequest {
    pub token: String,
    /// Also run the remote config check (subject to its retry-after deadline).
    pub check_remote_config: bool,
}

impl FlushRequest {
    pub fn new(token: impl Into<String>, check_remote_config: bool) -> Self {
        FlushRequest {
            token: token.into(),
            check_remote_config,
        }
    }
}

// =============================================================================
// Persisted Batch
// =============================================================================

/// An ordered run of queued records for one (table, token) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBatch {
    /// Id of the last record in the batch. Deletion is bounded by it.
    pub watermark: i64,

    /// JSON array of the batch's records, ready to send.
    pub payload: String,

    /// Number of records in `payload`.
    pub count: usize,
}

impl PersistedBatch {
    /// Joins already-serialized records into a JSON array payload.
    pub fn from_records<S: AsRef<str>>(watermark: i64, records: &[S]) -> Self {
        let mut payload = String::from("[");
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                payload.push(',');
            }
            payload.push_str(record.as_ref());
        }
        payload.push(']');

        PersistedBatch {
            watermark,
            payload,
            count: records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_normalize_event_name() {
        assert_eq!(normalize_event_name("Button Clicked"), "button_clicked");
        assert_eq!(normalize_event_name("sign-up Started"), "sign_up_started");
        assert_eq!(normalize_event_name("already_ok"), "already_ok");
    }

    #[test]
    fn test_timestamp_from_time_property() {
        let event = EventDescription::new("e", props(json!({"time": 1000})), "t", false)
            .with_ingestion_time(5);
        assert_eq!(event.timestamp(), 1000);

        let event = EventDescription::new("e", props(json!({"time": "2500"})), "t", false)
            .with_ingestion_time(5);
        assert_eq!(event.timestamp(), 2500);

        let event = EventDescription::new("e", props(json!({"time": 1234.9})), "t", false)
            .with_ingestion_time(5);
        assert_eq!(event.timestamp(), 1234);
    }

    #[test]
    fn test_timestamp_falls_back_to_ingestion_time() {
        let event = EventDescription::new("e", Map::new(), "t", false).with_ingestion_time(42);
        assert_eq!(event.timestamp(), 42);

        let event = EventDescription::new("e", props(json!({"time": "soon"})), "t", false)
            .with_ingestion_time(42);
        assert_eq!(event.timestamp(), 42);

        let event = EventDescription::new("e", props(json!({"time": null})), "t", false)
            .with_ingestion_time(42);
        assert_eq!(event.timestamp(), 42);
    }

    #[test]
    fn test_wire_record_shape() {
        let event = EventDescription::new(
            "Button Clicked",
            props(json!({"time": 1000, "color": "red"})),
            "abc",
            false,
        );
        let wire = event.to_wire(0).unwrap();
        let json = wire.to_json_string().unwrap();

        assert_eq!(
            json,
            r#"{"event":"button_clicked","ts":1000,"payload":{"seq_no":0,"time":1000,"color":"red"}}"#
        );
        assert_eq!(wire.seq_no(), Some(0));
    }

    #[test]
    fn test_empty_event_name_is_rejected() {
        let event = EventDescription::new("  ", Map::new(), "abc", false);
        assert!(matches!(event.to_wire(0), Err(CoreError::EmptyEventName)));
    }

    #[test]
    fn test_profile_update_must_be_object() {
        let ok = ProfileUpdate::new(json!({"$set": {"plan": "pro"}}), "abc");
        assert_eq!(
            ok.to_record_string().unwrap(),
            r#"{"$set":{"plan":"pro"}}"#
        );

        let bad = ProfileUpdate::new(json!([1, 2]), "abc");
        assert!(matches!(
            bad.to_record_string(),
            Err(CoreError::InvalidProfilePayload(_))
        ));
    }

    #[test]
    fn test_batch_payload_is_json_array() {
        let batch = PersistedBatch::from_records(7, &[r#"{"a":1}"#, r#"{"b":2}"#]);
        assert_eq!(batch.payload, r#"[{"a":1},{"b":2}]"#);
        assert_eq!(batch.count, 2);
        assert_eq!(batch.watermark, 7);

        let parsed: Value = serde_json::from_str(&batch.payload).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_table_names() {
        assert_eq!(Table::Events.as_str(), "events");
        assert_eq!(Table::People.to_string(), "people");
    }
}
