//! Field-path definitions describing where the engine finds event fields and
//! where it writes notification fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;
use crate::path;

/// Dotted paths locating the logical fields of an inbound event.
///
/// Every path is optional. A `None` (or empty) path means the field is not
/// carried by events of this deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub id: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub aggregate_id: Option<String>,
    pub aggregate: Option<String>,
    pub context: Option<String>,
    pub revision: Option<String>,
    pub payload: Option<String>,
    pub correlation_id: Option<String>,
    pub meta: Option<String>,
}

impl Default for EventDefinition {
    fn default() -> Self {
        Self {
            id: Some("id".to_string()),
            name: Some("name".to_string()),
            version: None,
            aggregate_id: None,
            aggregate: None,
            context: None,
            revision: None,
            payload: Some("payload".to_string()),
            correlation_id: Some("correlationId".to_string()),
            meta: None,
        }
    }
}

fn defined(path: &Option<String>) -> Option<&str> {
    path.as_deref().filter(|p| !p.is_empty())
}

impl EventDefinition {
    /// Creates the default definition (`id`, `name`, `payload`, `correlationId`).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, path: impl Into<String>) -> Self {
        self.id = Some(path.into());
        self
    }

    pub fn with_name(mut self, path: impl Into<String>) -> Self {
        self.name = Some(path.into());
        self
    }

    pub fn with_version(mut self, path: impl Into<String>) -> Self {
        self.version = Some(path.into());
        self
    }

    pub fn with_aggregate_id(mut self, path: impl Into<String>) -> Self {
        self.aggregate_id = Some(path.into());
        self
    }

    pub fn with_aggregate(mut self, path: impl Into<String>) -> Self {
        self.aggregate = Some(path.into());
        self
    }

    pub fn with_context(mut self, path: impl Into<String>) -> Self {
        self.context = Some(path.into());
        self
    }

    pub fn with_revision(mut self, path: impl Into<String>) -> Self {
        self.revision = Some(path.into());
        self
    }

    pub fn with_payload(mut self, path: impl Into<String>) -> Self {
        self.payload = Some(path.into());
        self
    }

    pub fn with_correlation_id(mut self, path: impl Into<String>) -> Self {
        self.correlation_id = Some(path.into());
        self
    }

    pub fn with_meta(mut self, path: impl Into<String>) -> Self {
        self.meta = Some(path.into());
        self
    }

    fn string_at(path: &Option<String>, event: &Event) -> Option<String> {
        defined(path).and_then(|p| event.get_string(p))
    }

    pub fn id_of(&self, event: &Event) -> Option<String> {
        Self::string_at(&self.id, event)
    }

    pub fn name_of(&self, event: &Event) -> Option<String> {
        Self::string_at(&self.name, event)
    }

    /// Event version; absent or non-numeric versions read as 0.
    pub fn version_of(&self, event: &Event) -> i64 {
        defined(&self.version)
            .and_then(|p| event.get(p))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn aggregate_id_of(&self, event: &Event) -> Option<String> {
        Self::string_at(&self.aggregate_id, event)
    }

    pub fn aggregate_of(&self, event: &Event) -> Option<String> {
        Self::string_at(&self.aggregate, event)
    }

    pub fn context_of(&self, event: &Event) -> Option<String> {
        Self::string_at(&self.context, event)
    }

    /// Event revision, if the definition tracks one and the event carries a
    /// non-negative integer there.
    pub fn revision_of(&self, event: &Event) -> Option<u64> {
        defined(&self.revision)
            .and_then(|p| event.get(p))
            .and_then(Value::as_u64)
    }

    /// Payload handed to view builders. An unset or empty path yields the
    /// whole event.
    pub fn payload_of(&self, event: &Event) -> Value {
        match defined(&self.payload) {
            Some(p) => event.get(p).cloned().unwrap_or(Value::Null),
            None => event.as_value().clone(),
        }
    }

    pub fn correlation_id_of<'a>(&self, event: &'a Event) -> Option<&'a Value> {
        defined(&self.correlation_id).and_then(|p| event.get(p))
    }

    pub fn meta_of<'a>(&self, event: &'a Event) -> Option<&'a Value> {
        defined(&self.meta).and_then(|p| event.get(p))
    }

    /// Returns true if this event is subject to revision ordering: both the
    /// revision and aggregate id paths are defined and present on the event.
    pub fn tracks_revision(&self, event: &Event) -> bool {
        matches!(defined(&self.revision), Some(p) if event.exists(p))
            && matches!(defined(&self.aggregate_id), Some(p) if event.exists(p))
    }

    /// Key under which revision checkpoints are stored: the concatenation of
    /// context, aggregate name and aggregate id, skipping absent parts.
    pub fn aggregate_key(&self, event: &Event) -> String {
        let mut key = String::new();
        for part in [
            self.context_of(event),
            self.aggregate_of(event),
            self.aggregate_id_of(event),
        ]
        .into_iter()
        .flatten()
        {
            key.push_str(&part);
        }
        key
    }
}

/// Dotted paths used when building notifications.
///
/// `correlation_id`, `id`, `action`, `collection` and `payload` are always
/// written. The remaining paths, when set, receive a copy of the matching
/// event field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDefinition {
    pub correlation_id: Option<String>,
    pub id: Option<String>,
    pub action: Option<String>,
    pub collection: Option<String>,
    pub payload: Option<String>,
    pub context: Option<String>,
    pub aggregate: Option<String>,
    pub aggregate_id: Option<String>,
    pub revision: Option<String>,
    pub event_id: Option<String>,
    pub event: Option<String>,
    pub meta: Option<String>,
}

impl Default for NotificationDefinition {
    fn default() -> Self {
        Self {
            correlation_id: Some("correlationId".to_string()),
            id: Some("id".to_string()),
            action: Some("name".to_string()),
            collection: Some("collection".to_string()),
            payload: Some("payload".to_string()),
            context: None,
            aggregate: None,
            aggregate_id: None,
            revision: None,
            event_id: None,
            event: None,
            meta: None,
        }
    }
}

impl NotificationDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, path: impl Into<String>) -> Self {
        self.correlation_id = Some(path.into());
        self
    }

    pub fn with_id(mut self, path: impl Into<String>) -> Self {
        self.id = Some(path.into());
        self
    }

    pub fn with_action(mut self, path: impl Into<String>) -> Self {
        self.action = Some(path.into());
        self
    }

    pub fn with_collection(mut self, path: impl Into<String>) -> Self {
        self.collection = Some(path.into());
        self
    }

    pub fn with_payload(mut self, path: impl Into<String>) -> Self {
        self.payload = Some(path.into());
        self
    }

    pub fn with_context(mut self, path: impl Into<String>) -> Self {
        self.context = Some(path.into());
        self
    }

    pub fn with_aggregate(mut self, path: impl Into<String>) -> Self {
        self.aggregate = Some(path.into());
        self
    }

    pub fn with_aggregate_id(mut self, path: impl Into<String>) -> Self {
        self.aggregate_id = Some(path.into());
        self
    }

    pub fn with_revision(mut self, path: impl Into<String>) -> Self {
        self.revision = Some(path.into());
        self
    }

    pub fn with_event_id(mut self, path: impl Into<String>) -> Self {
        self.event_id = Some(path.into());
        self
    }

    pub fn with_event(mut self, path: impl Into<String>) -> Self {
        self.event = Some(path.into());
        self
    }

    pub fn with_meta(mut self, path: impl Into<String>) -> Self {
        self.meta = Some(path.into());
        self
    }

    /// Writes `value` at the notification path, if that path is configured.
    pub fn write(target: &mut Value, path: &Option<String>, value: Value) {
        if let Some(p) = defined(path) {
            path::put(target, p, value);
        }
    }

    /// Copies the field found at `source` in the event to `target_path` in
    /// the notification. Missing source fields are skipped.
    pub fn copy_from_event(
        target: &mut Value,
        target_path: &Option<String>,
        event: &Event,
        source: &Option<String>,
    ) {
        let (Some(to), Some(from)) = (defined(target_path), defined(source)) else {
            return;
        };
        if let Some(value) = event.get(from) {
            path::put(target, to, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_definition() -> EventDefinition {
        EventDefinition::new()
            .with_aggregate_id("aggregate.id")
            .with_aggregate("aggregate.name")
            .with_context("context.name")
            .with_revision("revision")
            .with_version("version")
            .with_meta("meta")
    }

    #[test]
    fn reads_configured_fields() {
        let def = full_definition();
        let event = Event::new(json!({
            "id": "e1",
            "name": "enteredNewPerson",
            "version": 2,
            "aggregate": {"id": "a1", "name": "person"},
            "context": {"name": "hr"},
            "revision": 3,
            "payload": {"firstname": "Jan"}
        }));

        assert_eq!(def.id_of(&event).as_deref(), Some("e1"));
        assert_eq!(def.name_of(&event).as_deref(), Some("enteredNewPerson"));
        assert_eq!(def.version_of(&event), 2);
        assert_eq!(def.aggregate_of(&event).as_deref(), Some("person"));
        assert_eq!(def.context_of(&event).as_deref(), Some("hr"));
        assert_eq!(def.revision_of(&event), Some(3));
        assert_eq!(def.payload_of(&event), json!({"firstname": "Jan"}));
        assert!(def.tracks_revision(&event));
        assert_eq!(def.aggregate_key(&event), "hrpersona1");
    }

    #[test]
    fn missing_fields_default() {
        let def = full_definition();
        let event = Event::new(json!({"name": "x", "aggregate": {"id": "a1"}}));

        assert_eq!(def.version_of(&event), 0);
        assert_eq!(def.context_of(&event), None);
        assert!(!def.tracks_revision(&event));
        assert_eq!(def.aggregate_key(&event), "a1");
    }

    #[test]
    fn empty_payload_path_yields_whole_event() {
        let def = EventDefinition::new().with_payload("");
        let event = Event::new(json!({"name": "x", "a": 1}));
        assert_eq!(def.payload_of(&event), json!({"name": "x", "a": 1}));
    }

    #[test]
    fn notification_copies_from_event() {
        let def = full_definition();
        let noti_def = NotificationDefinition::new().with_aggregate_id("meta.aggregate.id");
        let event = Event::new(json!({"aggregate": {"id": "a1"}}));

        let mut noti = json!({});
        NotificationDefinition::copy_from_event(
            &mut noti,
            &noti_def.aggregate_id,
            &event,
            &def.aggregate_id,
        );
        NotificationDefinition::copy_from_event(&mut noti, &noti_def.context, &event, &def.context);

        assert_eq!(noti, json!({"meta": {"aggregate": {"id": "a1"}}}));
    }
}
