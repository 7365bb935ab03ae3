//! Shared building blocks for the denormalizer crates.
//!
//! Events arrive as free-form JSON records. Every field the engine cares about
//! (id, name, aggregate, revision, ...) is located through a configurable dotted
//! path, so the same engine can consume events of any shape.

pub mod definition;
pub mod event;
pub mod path;

pub use definition::{EventDefinition, NotificationDefinition};
pub use event::Event;
