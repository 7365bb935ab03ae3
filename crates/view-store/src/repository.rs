use async_trait::async_trait;
use uuid::Uuid;

use crate::{Action, Query, QueryOptions, Result, ViewModel};

/// Core trait for view-model repository implementations.
///
/// Commits are optimistic: an implementation must reject a commit with
/// [`RepositoryError::ConcurrencyConflict`](crate::RepositoryError::ConcurrencyConflict)
/// when the stored version differs from the version the view model was
/// loaded at. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ViewModelRepository: Send + Sync {
    /// Opens the backend connection.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Closes the backend connection.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// Returns a fresh view-model id.
    async fn get_new_id(&self) -> Result<String> {
        Ok(Uuid::new_v4().to_string())
    }

    /// Loads a view model by id.
    ///
    /// A missing view model is returned as a new one whose action on commit
    /// is [`Action::Create`].
    async fn get(&self, id: &str) -> Result<ViewModel>;

    /// Finds stored view models matching a query.
    async fn find(&self, query: &Query, options: &QueryOptions) -> Result<Vec<ViewModel>>;

    /// Persists a view model according to its action on commit.
    async fn commit(&self, vm: ViewModel) -> Result<()>;

    /// Returns true if [`bulk_commit`](Self::bulk_commit) is a native
    /// batch operation of this backend.
    fn supports_bulk_commit(&self) -> bool {
        false
    }

    /// Persists several view models.
    ///
    /// The default commits them one after another.
    async fn bulk_commit(&self, vms: Vec<ViewModel>) -> Result<()> {
        for vm in vms {
            self.commit(vm).await?;
        }
        Ok(())
    }

    /// Removes every stored view model.
    async fn clear(&self) -> Result<()>;
}

/// Extension trait providing convenience methods for repositories.
#[async_trait]
pub trait ViewModelRepositoryExt: ViewModelRepository {
    /// Loads a view model, returning `None` if it was never stored.
    async fn get_if_exists(&self, id: &str) -> Result<Option<ViewModel>> {
        let vm = self.get(id).await?;
        if vm.action_on_commit() == Action::Create {
            return Ok(None);
        }
        Ok(Some(vm))
    }

    /// Returns every stored view model.
    async fn find_all(&self) -> Result<Vec<ViewModel>> {
        self.find(&Query::new(), &QueryOptions::new()).await
    }
}

// Blanket implementation for all ViewModelRepository implementations
impl<T: ViewModelRepository + ?Sized> ViewModelRepositoryExt for T {}
