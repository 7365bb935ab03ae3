//! View-model persistence for the read side.
//!
//! This crate provides:
//! - [`ViewModel`], the mutable projection entity with its commit action
//! - [`ViewModelRepository`], the backend trait with optimistic-concurrency commits
//! - [`InMemoryRepository`] for tests and single-process deployments
//! - [`Query`] / [`QueryOptions`] for simple attribute matching

pub mod error;
pub mod memory;
pub mod query;
pub mod repository;
pub mod view_model;

pub use error::{RepositoryError, Result};
pub use memory::InMemoryRepository;
pub use query::{Query, QueryOptions, SortOrder};
pub use repository::{ViewModelRepository, ViewModelRepositoryExt};
pub use view_model::{Action, ViewModel};
