//! Domain event + JSON wire codec.
//!
//! The same type both creates new events (`DomainEvent::new`) and recreates
//! received ones (`DomainEvent::from_slice`). Wire shape:
//!
//! ```json
//! {
//!   "routing_key": "user.registered",
//!   "data": {"user_id": 7},
//!   "domain_object_id": "7",
//!   "uuid_string": "0b1c…",
//!   "timestamp": 1700000000.25,
//!   "retries": 0
//! }
//! ```
//!
//! Missing keys get defaults on decode: empty routing key, `{}` data, no
//! object id, a fresh UUID, the current time and zero retries. Unknown keys
//! are ignored.

use std::fmt;

use chrono::Utc;
use herald_core::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A unit of domain information travelling through the broker.
///
/// Equality compares every field, `retries` included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(default)]
    routing_key: String,
    #[serde(default = "empty_object")]
    data: JsonValue,
    #[serde(default)]
    domain_object_id: Option<String>,
    #[serde(default = "new_uuid_string")]
    uuid_string: String,
    #[serde(default = "now_timestamp")]
    timestamp: f64,
    #[serde(default)]
    retries: u32,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

fn new_uuid_string() -> String {
    Uuid::new_v4().to_string()
}

fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl DomainEvent {
    /// Create a new event with a fresh id and the current time.
    ///
    /// `routing_key` is of the form `<domain>.<event_type>`, e.g.
    /// `user.registered`. The broker matches it against binding patterns.
    pub fn new(routing_key: impl Into<String>, data: JsonValue) -> Self {
        Self {
            routing_key: routing_key.into(),
            data,
            domain_object_id: None,
            uuid_string: new_uuid_string(),
            timestamp: now_timestamp(),
            retries: 0,
        }
    }

    pub fn with_domain_object_id(mut self, id: impl Into<String>) -> Self {
        self.domain_object_id = Some(id.into());
        self
    }

    /// Use an existing id instead of the generated one.
    pub fn with_uuid(mut self, uuid_string: impl Into<String>) -> Self {
        self.uuid_string = uuid_string.into();
        self
    }

    /// Seconds since the Unix epoch.
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    pub fn domain_object_id(&self) -> Option<&str> {
        self.domain_object_id.as_deref()
    }

    pub fn uuid_string(&self) -> &str {
        &self.uuid_string
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// How many delayed retries this delivery has been through.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Overwritten by the receiving side from broker redelivery metadata.
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Serialize to the JSON wire format.
    pub fn to_json_bytes(&self) -> BrokerResult<Vec<u8>> {
        if !self.timestamp.is_finite() {
            return Err(BrokerError::malformed(format!(
                "timestamp {} is not a finite number",
                self.timestamp
            )));
        }
        serde_json::to_vec(self).map_err(|e| BrokerError::malformed(e.to_string()))
    }

    /// Parse the JSON wire format.
    ///
    /// Fails with `MalformedPayload` when the bytes are not JSON, not a JSON
    /// object, or carry a known key with the wrong type.
    pub fn from_slice(bytes: &[u8]) -> BrokerResult<Self> {
        let value: JsonValue =
            serde_json::from_slice(bytes).map_err(|e| BrokerError::malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(BrokerError::malformed("event payload must be a JSON object"));
        }
        serde_json::from_value(value).map_err(|e| BrokerError::malformed(e.to_string()))
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DomainEvent('{}', '{}', (domain_obj_id: {}, uuid: {}))",
            self.routing_key,
            self.data,
            self.domain_object_id.as_deref().unwrap_or("None"),
            self.uuid_string
        )
    }
}
