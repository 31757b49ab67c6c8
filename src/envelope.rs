//! Expiry Envelope Codec
//!
//! Values written with a TTL are stored inside an envelope:
//!
//! ```text
//! {"value": <payload>, "expiry": <epoch millis>}
//! ```
//!
//! Values without a TTL are stored as their bare JSON. A stored entry is
//! treated as an envelope only when it is an object whose keys are exactly
//! `value` and `expiry` and `expiry` is an integer, so payloads that merely
//! contain a `value` field are never unwrapped by accident.
//!
//! ## State Transitions
//!
//! ```text
//!   write(ttl)          now > expiry            read
//!  ──────────> Live ─────────────────> Expired ──────> Absent
//!                                      (purged lazily)
//! ```

use serde_json::{Map, Value};

const VALUE_FIELD: &str = "value";
const EXPIRY_FIELD: &str = "expiry";

/// A decoded store entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The caller's payload, with any envelope removed.
    pub value: Value,
    /// Absolute deadline in epoch milliseconds, if the entry carries a TTL.
    pub expiry: Option<i64>,
}

impl Entry {
    /// An entry without expiry.
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            expiry: None,
        }
    }

    /// An entry that expires at `expiry`.
    pub fn expiring(value: Value, expiry: i64) -> Self {
        Self {
            value,
            expiry: Some(expiry),
        }
    }

    /// Expiry is strict: an entry is still live at exactly its deadline.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry.map(|exp| now > exp).unwrap_or(false)
    }

    /// Decodes a raw stored string.
    ///
    /// Strings that are not valid JSON are passed through as JSON strings.
    pub fn decode(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| Self::plain(Value::String(raw.to_string())))
    }

    /// Decodes a raw stored string, or `None` if it is not valid JSON.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<Value>(raw).ok().map(Self::from_json)
    }

    /// Splits an already parsed JSON value into payload and expiry.
    pub fn from_json(json: Value) -> Self {
        match json {
            Value::Object(mut map) if is_envelope(&map) => {
                let expiry = map.get(EXPIRY_FIELD).and_then(Value::as_i64);
                let value = map.remove(VALUE_FIELD).unwrap_or(Value::Null);
                Self { value, expiry }
            }
            other => Self::plain(other),
        }
    }

    /// Returns the JSON form that gets persisted.
    pub fn to_json(&self) -> Value {
        match self.expiry {
            Some(expiry) => {
                let mut map = Map::with_capacity(2);
                map.insert(VALUE_FIELD.to_string(), self.value.clone());
                map.insert(EXPIRY_FIELD.to_string(), Value::from(expiry));
                Value::Object(map)
            }
            None => self.value.clone(),
        }
    }

    /// Serializes the persisted form.
    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    map.len() == 2
        && map.contains_key(VALUE_FIELD)
        && map.get(EXPIRY_FIELD).map(Value::is_i64).unwrap_or(false)
}
