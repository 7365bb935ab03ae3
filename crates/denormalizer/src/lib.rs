//! Read-model denormalizer for event-sourced systems.
//!
//! This crate provides:
//! - [`Collection`], a named view-model store that buffers writes during replay
//! - [`ViewBuilder`] and [`EventExtender`], the per-event projection and
//!   enrichment rules, routed by [`Selector`]
//! - [`Registry`], the validated set of collections and their rules
//! - [`EventDispatcher`], which fans an event out to its view builders
//! - [`ReplayHandler`], which rebuilds view models from historical events
//! - [`Denormalizer`], the facade tying the revision guard, dispatch, replay
//!   and host hooks together

pub mod collection;
pub mod config;
pub mod denormalizer;
pub mod dispatcher;
pub mod error;
pub mod event_extender;
pub mod registry;
pub mod replay;
pub mod selector;
pub mod view_builder;

pub use collection::Collection;
pub use config::{DenormalizerOptions, IdGenerator, Settings};
pub use denormalizer::{
    Denormalizer, DenormalizerBuilder, DispatchOutcome, EventExtension, EventHook, HandleError,
    Handled, NotificationHook,
};
pub use dispatcher::{Dispatched, EventDispatcher};
pub use error::{BoxError, DenormalizerError, Errors, Result};
pub use event_extender::{EventExtender, ExtendFn};
pub use registry::{
    BoundEventExtender, BoundViewBuilder, CollectionInfo, Registry, RegistryBuilder, RegistryInfo,
    ViewBuilderInfo,
};
pub use replay::{ReplayHandler, ReplaySession};
pub use selector::{ANY_VERSION, Pass, Selector, Target};
pub use view_builder::{DenormContext, DenormFn, RetryDelay, ViewBuilder};

pub use common::{Event, EventDefinition, NotificationDefinition};
pub use revision_guard::{
    GuardConfig, InMemoryRevisionStore, MissingEventInfo, MissingEventPolicy, RevisionGuardStore,
};
pub use view_store::{InMemoryRepository, Query, QueryOptions, ViewModel, ViewModelRepository};
