//! Event routing: which view builders and extenders an event reaches.
//!
//! Every registered definition carries a [`Selector`]. An incoming event is
//! reduced to a [`Target`] and matched in up to four passes, from most to
//! least specific. The first pass that matches anything wins:
//!
//! | Pass | name | version | aggregate | context |
//! |---|---|---|---|---|
//! | [`Pass::Exact`] | = | = or any | = | = |
//! | [`Pass::Aggregate`] | = | = or any | = | = or either unset |
//! | [`Pass::Loose`] | = | = or any | = or either unset | = or either unset |
//! | [`Pass::Generic`] | `""` | = or any | = or either unset | = or either unset |

use common::{Event, EventDefinition};
use serde::Serialize;

/// Version wildcard: a selector with this version matches every version.
pub const ANY_VERSION: i64 = -1;

/// The routing-relevant fields of one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Target {
    pub name: String,
    pub version: i64,
    pub aggregate: Option<String>,
    pub context: Option<String>,
}

impl Target {
    /// Reads the target fields using `definition`. Absent names read as
    /// `""`, absent versions as 0.
    pub fn of(definition: &EventDefinition, event: &Event) -> Self {
        Self {
            name: definition.name_of(event).unwrap_or_default(),
            version: definition.version_of(event),
            aggregate: definition.aggregate_of(event),
            context: definition.context_of(event),
        }
    }
}

/// One step of the matching cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Exact,
    Aggregate,
    Loose,
    Generic,
}

impl Pass {
    /// All passes, most specific first.
    pub const CASCADE: [Pass; 4] = [Pass::Exact, Pass::Aggregate, Pass::Loose, Pass::Generic];
}

/// The events a definition is registered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selector {
    pub name: String,
    pub version: i64,
    pub aggregate: Option<String>,
    pub context: Option<String>,
}

impl Selector {
    /// Selects events named `name` at version 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            aggregate: None,
            context: None,
        }
    }

    /// Selects every event that no named selector claims.
    pub fn generic() -> Self {
        Self::new("")
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn any_version(self) -> Self {
        self.with_version(ANY_VERSION)
    }

    pub fn for_aggregate(mut self, aggregate: impl Into<String>) -> Self {
        self.aggregate = Some(aggregate.into());
        self
    }

    pub fn in_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn is_generic(&self) -> bool {
        self.name.is_empty()
    }

    /// Returns true if this selector matches `target` in the given pass.
    pub fn matches(&self, target: &Target, pass: Pass) -> bool {
        let version = self.version == target.version || self.version == ANY_VERSION;
        let name = match pass {
            Pass::Generic => self.is_generic(),
            _ => self.name == target.name,
        };
        let aggregate = match pass {
            Pass::Exact | Pass::Aggregate => self.aggregate == target.aggregate,
            Pass::Loose | Pass::Generic => loose_eq(&self.aggregate, &target.aggregate),
        };
        let context = match pass {
            Pass::Exact => self.context == target.context,
            _ => loose_eq(&self.context, &target.context),
        };
        name && version && aggregate && context
    }

    /// Display name used in logs and errors.
    pub fn label(&self) -> &str {
        if self.is_generic() { "*" } else { &self.name }
    }
}

fn loose_eq(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Returns every item matched by the most specific pass that matches any.
pub fn select_all<'a, T>(
    items: &'a [T],
    target: &Target,
    selector: impl Fn(&T) -> &Selector,
) -> Vec<&'a T> {
    for pass in Pass::CASCADE {
        let found: Vec<&T> = items
            .iter()
            .filter(|item| selector(*item).matches(target, pass))
            .collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}

/// Returns the first item matched by the most specific pass that matches any.
pub fn select_first<'a, T>(
    items: &'a [T],
    target: &Target,
    selector: impl Fn(&T) -> &Selector,
) -> Option<&'a T> {
    Pass::CASCADE
        .into_iter()
        .find_map(|pass| {
            items
                .iter()
                .find(|item| selector(*item).matches(target, pass))
        })
}
