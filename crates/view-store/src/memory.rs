use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    Action, Query, QueryOptions, RepositoryError, Result, ViewModel,
    repository::ViewModelRepository,
};

#[derive(Debug, Clone)]
struct StoredViewModel {
    attributes: Value,
    version: u64,
}

/// In-memory view-model repository.
///
/// Each stored view model carries a version that is bumped on every commit,
/// so concurrent writers are detected the same way a document store with
/// optimistic locking would detect them.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    models: Arc<RwLock<HashMap<String, StoredViewModel>>>,
    bulk: bool,
}

impl InMemoryRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository that reports native bulk-commit support.
    pub fn with_bulk_commit() -> Self {
        Self {
            bulk: true,
            ..Self::default()
        }
    }

    /// Returns the number of stored view models.
    pub async fn len(&self) -> usize {
        self.models.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.models.read().await.is_empty()
    }

    fn apply(models: &mut HashMap<String, StoredViewModel>, vm: ViewModel) -> Result<()> {
        let actual = models.get(vm.id()).map(|m| m.version).unwrap_or(0);
        if actual != vm.version() {
            tracing::debug!(id = vm.id(), expected = vm.version(), actual, "commit rejected");
            metrics::counter!("view_store_commit_conflicts_total").increment(1);
            return Err(RepositoryError::ConcurrencyConflict {
                id: vm.id().to_string(),
                expected: vm.version(),
                actual,
            });
        }

        match vm.action_on_commit() {
            Action::Delete => {
                models.remove(vm.id());
            }
            Action::Create | Action::Update => {
                if !vm.attributes().is_object() {
                    return Err(RepositoryError::InvalidViewModel(format!(
                        "attributes of {} are not an object",
                        vm.id()
                    )));
                }
                models.insert(
                    vm.id().to_string(),
                    StoredViewModel {
                        attributes: vm.attributes().clone(),
                        version: actual + 1,
                    },
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ViewModelRepository for InMemoryRepository {
    async fn get(&self, id: &str) -> Result<ViewModel> {
        let models = self.models.read().await;
        Ok(match models.get(id) {
            Some(stored) => ViewModel::from_stored(id, stored.attributes.clone(), stored.version),
            None => ViewModel::new(id),
        })
    }

    async fn find(&self, query: &Query, options: &QueryOptions) -> Result<Vec<ViewModel>> {
        let models = self.models.read().await;
        let mut found: Vec<ViewModel> = models
            .iter()
            .map(|(id, stored)| {
                ViewModel::from_stored(id, stored.attributes.clone(), stored.version)
            })
            .filter(|vm| query.matches(&vm.to_json()))
            .collect();

        // Stable base order for unsorted queries
        found.sort_by(|a, b| a.id().cmp(b.id()));

        Ok(options.apply(found, ViewModel::to_json))
    }

    async fn commit(&self, vm: ViewModel) -> Result<()> {
        let mut models = self.models.write().await;
        Self::apply(&mut models, vm)
    }

    fn supports_bulk_commit(&self) -> bool {
        self.bulk
    }

    async fn bulk_commit(&self, vms: Vec<ViewModel>) -> Result<()> {
        let mut models = self.models.write().await;
        for vm in vms {
            Self::apply(&mut models, vm)?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.models.write().await.clear();
        Ok(())
    }
}
