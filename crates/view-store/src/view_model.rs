//! The view model entity.

use common::path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a commit does with a view model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Not yet persisted; the commit inserts it.
    Create,
    /// Loaded from the store; the commit replaces it.
    Update,
    /// Marked for removal; the commit deletes it.
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// A materialized, queryable projection entity.
///
/// `version` is the stored version the model was loaded at (0 for models that
/// have never been committed). Repositories compare it against the stored
/// version on commit to detect concurrent writers.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewModel {
    id: String,
    attributes: Value,
    action_on_commit: Action,
    version: u64,
}

impl ViewModel {
    /// Creates a fresh, never-persisted view model.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Value::Object(Map::new()),
            action_on_commit: Action::Create,
            version: 0,
        }
    }

    /// Rehydrates a view model loaded from a store.
    pub fn from_stored(id: impl Into<String>, attributes: Value, version: u64) -> Self {
        let attributes = match attributes {
            Value::Object(mut map) => {
                map.remove("id");
                Value::Object(map)
            }
            _ => Value::Object(Map::new()),
        };
        Self {
            id: id.into(),
            attributes,
            action_on_commit: Action::Update,
            version,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action_on_commit(&self) -> Action {
        self.action_on_commit
    }

    /// Overrides the commit action. Used when replaying buffered writes.
    pub fn set_action_on_commit(&mut self, action: Action) {
        self.action_on_commit = action;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Attributes without the id.
    pub fn attributes(&self) -> &Value {
        &self.attributes
    }

    /// Returns the attribute at a dotted path. `"id"` resolves to the id.
    pub fn get(&self, key: &str) -> Option<Value> {
        if key == "id" {
            return Some(Value::String(self.id.clone()));
        }
        path::get(&self.attributes, key).cloned()
    }

    /// Returns true if an attribute is present at a dotted path.
    pub fn has(&self, key: &str) -> bool {
        key == "id" || path::exists(&self.attributes, key)
    }

    /// Writes an attribute at a dotted path.
    pub fn set(&mut self, key: &str, value: Value) {
        if key == "id" || key.is_empty() {
            return;
        }
        path::put(&mut self.attributes, key, value);
    }

    /// Merges the top-level fields of an object into the attributes.
    /// Non-object values are ignored.
    pub fn merge(&mut self, value: &Value) {
        let (Value::Object(target), Value::Object(source)) = (&mut self.attributes, value) else {
            return;
        };
        for (key, field) in source {
            if key != "id" {
                target.insert(key.clone(), field.clone());
            }
        }
    }

    /// Sets every top-level field from `defaults` that is not yet present.
    pub fn backfill(&mut self, defaults: &Map<String, Value>) {
        for (key, value) in defaults {
            if !self.has(key) {
                self.set(key, value.clone());
            }
        }
    }

    /// Marks the view model for deletion on the next commit.
    pub fn destroy(&mut self) {
        self.action_on_commit = Action::Delete;
    }

    /// Returns the attributes as a JSON object including the id.
    pub fn to_json(&self) -> Value {
        let mut json = self.attributes.clone();
        if let Value::Object(map) = &mut json {
            map.insert("id".to_string(), Value::String(self.id.clone()));
        }
        json
    }
}
