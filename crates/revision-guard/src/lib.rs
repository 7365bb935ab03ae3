//! Revision ordering for live event handling.
//!
//! This crate provides:
//! - [`OrderQueue`], a per-key delayed-retry queue
//! - [`RevisionGuardStore`], the checkpoint store trait, and
//!   [`InMemoryRevisionStore`]
//! - [`RevisionGuard`], which admits events for an aggregate strictly in
//!   revision order and parks events that arrive early

pub mod config;
pub mod error;
pub mod guard;
pub mod memory;
pub mod queue;
pub mod store;

pub use config::{GuardConfig, MissingEventPolicy};
pub use error::{GuardError, Result};
pub use guard::{Admission, GuardOutcome, MissingEventHook, MissingEventInfo, RevisionGuard};
pub use memory::InMemoryRevisionStore;
pub use queue::{OrderQueue, TimeoutDecision};
pub use store::{ConnectionEvent, RevisionGuardStore};
