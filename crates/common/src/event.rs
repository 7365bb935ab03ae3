use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path;

/// An inbound domain event, kept as the structured record it was delivered as.
///
/// The engine never mutates an event in place: extenders produce a new
/// `Event` and view builders receive cloned payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Value);

impl Event {
    /// Wraps a JSON value as an event.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Returns the underlying JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consumes the event, returning the underlying JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Returns true if the event is a JSON object.
    pub fn is_object(&self) -> bool {
        self.0.is_object()
    }

    /// Returns the value at a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path::get(&self.0, path)
    }

    /// Returns true if a value is present at a dotted path.
    pub fn exists(&self, path: &str) -> bool {
        path::exists(&self.0, path)
    }

    /// Returns the scalar at a dotted path rendered as a string.
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).and_then(path::scalar_to_string)
    }

    /// Returns a copy of this event with `value` written at `path`.
    pub fn with(&self, path: &str, value: Value) -> Self {
        let mut copy = self.0.clone();
        path::put(&mut copy, path, value);
        Self(copy)
    }
}

impl From<Value> for Event {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        event.0
    }
}
