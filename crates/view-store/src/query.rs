use std::cmp::Ordering;

use common::path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Equality query over view-model attributes.
///
/// Each condition pairs a dotted attribute path with the value it must equal.
/// An empty query matches every view model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub conditions: Vec<(String, Value)>,
}

impl Query {
    /// Creates a query matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query from the top-level fields of a JSON object.
    pub fn from_json(value: &Value) -> Self {
        let conditions = value
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { conditions }
    }

    /// Adds a condition: the attribute at `path` must equal `value`.
    pub fn field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((path.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Returns true if every condition holds for `document`.
    pub fn matches(&self, document: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| path::get(document, key) == Some(expected))
    }
}

/// Sort direction for [`QueryOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Sorting and paging applied to query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Sort keys, applied in order.
    pub sort: Vec<(String, SortOrder)>,

    /// Number of results to skip.
    pub skip: Option<usize>,

    /// Maximum number of results to return.
    pub limit: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sort key.
    pub fn sort_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((path.into(), order));
        self
    }

    /// Skips this many results.
    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Limits the number of results returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Orders two documents by the configured sort keys.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for (key, order) in &self.sort {
            let ordering = compare_values(path::get(a, key), path::get(b, key));
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Applies sorting, skip and limit to a list of items.
    pub fn apply<T>(&self, mut items: Vec<T>, document: impl Fn(&T) -> Value) -> Vec<T> {
        if !self.sort.is_empty() {
            items.sort_by(|a, b| self.compare(&document(a), &document(b)));
        }
        let skip = self.skip.unwrap_or(0);
        let items = items.into_iter().skip(skip);
        match self.limit {
            Some(limit) => items.take(limit).collect(),
            None => items.collect(),
        }
    }
}

// Missing < null < bool < number < string; arrays and objects compare equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_query_matches_everything() {
        assert!(Query::new().matches(&json!({"a": 1})));
    }

    #[test]
    fn query_matches_nested_equality() {
        let query = Query::new().field("address.city", "Bern").field("active", true);

        assert!(query.matches(&json!({"address": {"city": "Bern"}, "active": true})));
        assert!(!query.matches(&json!({"address": {"city": "Basel"}, "active": true})));
        assert!(!query.matches(&json!({"active": true})));
    }

    #[test]
    fn query_from_json() {
        let query = Query::from_json(&json!({"group": "a"}));
        assert_eq!(query.conditions, vec![("group".to_string(), json!("a"))]);
    }

    #[test]
    fn options_sort_skip_limit() {
        let docs = vec![json!({"n": 3}), json!({"n": 1}), json!({"n": 2}), json!({})];
        let options = QueryOptions::new()
            .sort_by("n", SortOrder::Descending)
            .skip(1)
            .limit(2);

        let result = options.apply(docs, |d: &Value| d.clone());
        assert_eq!(result, vec![json!({"n": 2}), json!({"n": 1})]);
    }
}
