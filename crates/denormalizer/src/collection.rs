//! Named view-model collection with replay buffering.
//!
//! Outside replay a collection passes loads and saves straight through to
//! its repository. While replaying, saves are buffered and reads prefer the
//! buffer, so a replay run commits each touched view model once when it is
//! flushed with [`Collection::save_replaying_vms`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use view_store::{Action, Query, QueryOptions, ViewModel, ViewModelRepository};

use crate::{DenormalizerError, Result};

#[derive(Debug, Clone)]
struct Buffered {
    vm: ViewModel,
    /// Action to apply on flush. `None` for view models that were only read.
    pending: Option<Action>,
}

#[derive(Debug, Default)]
struct ReplayBuffer {
    vms: BTreeMap<String, Buffered>,
    to_delete: BTreeMap<String, ViewModel>,
}

/// A named set of view models sharing one repository.
pub struct Collection {
    name: String,
    repository: Arc<dyn ViewModelRepository>,
    default_payload: String,
    model_init_values: Map<String, Value>,
    no_replay: bool,
    replaying: AtomicBool,
    buffer: Mutex<ReplayBuffer>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("default_payload", &self.default_payload)
            .field("no_replay", &self.no_replay)
            .field("replaying", &self.is_replaying())
            .finish()
    }
}

impl Collection {
    pub fn new<R>(name: impl Into<String>, repository: R) -> Self
    where
        R: ViewModelRepository + 'static,
    {
        Self::with_shared_repository(name, Arc::new(repository))
    }

    pub fn with_shared_repository(
        name: impl Into<String>,
        repository: Arc<dyn ViewModelRepository>,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            default_payload: String::new(),
            model_init_values: Map::new(),
            no_replay: false,
            replaying: AtomicBool::new(false),
            buffer: Mutex::new(ReplayBuffer::default()),
        }
    }

    /// Payload path used by view builders that do not set their own.
    pub fn with_default_payload(mut self, path: impl Into<String>) -> Self {
        self.default_payload = path.into();
        self
    }

    /// Attributes set on every loaded view model that lacks them.
    /// Non-object values are ignored.
    pub fn with_model_init_values(mut self, values: Value) -> Self {
        if let Value::Object(map) = values {
            self.model_init_values = map;
        }
        self
    }

    /// Excludes this collection from replays.
    pub fn no_replay(mut self) -> Self {
        self.no_replay = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_payload(&self) -> &str {
        &self.default_payload
    }

    pub fn model_init_values(&self) -> &Map<String, Value> {
        &self.model_init_values
    }

    pub fn is_no_replay(&self) -> bool {
        self.no_replay
    }

    pub fn repository(&self) -> &Arc<dyn ViewModelRepository> {
        &self.repository
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// Enters replay mode. Returns false if the collection already was in it.
    pub fn start_replay(&self) -> bool {
        !self.replaying.swap(true, Ordering::SeqCst)
    }

    pub async fn connect(&self) -> Result<()> {
        Ok(self.repository.connect().await?)
    }

    pub async fn disconnect(&self) -> Result<()> {
        Ok(self.repository.disconnect().await?)
    }

    pub async fn get_new_id(&self) -> Result<String> {
        Ok(self.repository.get_new_id().await?)
    }

    /// Persists a view model, or buffers it while replaying.
    ///
    /// A buffered delete voids any pending write for the same id. The first
    /// buffered delete of an id is the one committed.
    pub async fn save_view_model(&self, mut vm: ViewModel) -> Result<()> {
        if !self.is_replaying() {
            return Ok(self.repository.commit(vm).await?);
        }

        let mut buffer = self.buffer.lock().await;
        let action = vm.action_on_commit();
        let id = vm.id().to_string();
        match action {
            Action::Delete => {
                buffer.vms.remove(&id);
                buffer.to_delete.entry(id).or_insert(vm);
            }
            Action::Create | Action::Update => {
                // Later saves of the same buffered model are updates.
                vm.set_action_on_commit(Action::Update);
                buffer.vms.insert(
                    id,
                    Buffered {
                        vm,
                        pending: Some(action),
                    },
                );
            }
        }
        Ok(())
    }

    /// Loads a view model by id, creating a new one if it was never stored.
    ///
    /// Missing init values are filled in. While replaying, buffered state
    /// wins over the repository and an id pending deletion yields a fresh
    /// view model.
    pub async fn load_view_model(&self, id: &str) -> Result<ViewModel> {
        if self.is_replaying() {
            let mut buffer = self.buffer.lock().await;
            if let Some(buffered) = buffer.vms.get(id) {
                return Ok(buffered.vm.clone());
            }
            if buffer.to_delete.contains_key(id) {
                let mut vm = ViewModel::new(id);
                vm.backfill(&self.model_init_values);
                buffer.vms.insert(
                    id.to_string(),
                    Buffered {
                        vm: vm.clone(),
                        pending: None,
                    },
                );
                return Ok(vm);
            }
        }

        let mut vm = self.repository.get(id).await?;
        vm.backfill(&self.model_init_values);

        if self.is_replaying() {
            let mut buffer = self.buffer.lock().await;
            let buffered = buffer
                .vms
                .entry(id.to_string())
                .or_insert_with(|| Buffered { vm, pending: None });
            return Ok(buffered.vm.clone());
        }
        Ok(vm)
    }

    /// Like [`load_view_model`](Self::load_view_model), but returns `None`
    /// for view models that do not exist yet.
    pub async fn load_view_model_if_exists(&self, id: &str) -> Result<Option<ViewModel>> {
        let vm = self.load_view_model(id).await?;
        if vm.action_on_commit() == Action::Create {
            return Ok(None);
        }
        Ok(Some(vm))
    }

    /// Finds view models matching `query`.
    ///
    /// While replaying, buffered view models are matched first, repository
    /// hits are merged in behind them (buffered state preferred, pending
    /// deletions excluded) and every returned model is buffered. `options`
    /// only applies to the repository query.
    pub async fn find_view_models(
        &self,
        query: &Query,
        options: &QueryOptions,
    ) -> Result<Vec<ViewModel>> {
        if !self.is_replaying() {
            return Ok(self.repository.find(query, options).await?);
        }

        let local: Vec<ViewModel> = {
            let buffer = self.buffer.lock().await;
            buffer
                .vms
                .values()
                .filter(|b| query.matches(&b.vm.to_json()))
                .map(|b| b.vm.clone())
                .collect()
        };
        let stored = self.repository.find(query, options).await?;

        let mut buffer = self.buffer.lock().await;
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for vm in local.into_iter().chain(stored) {
            if buffer.to_delete.contains_key(vm.id()) || seen.contains(vm.id()) {
                continue;
            }
            let vm = match buffer.vms.get(vm.id()) {
                Some(buffered) => buffered.vm.clone(),
                None => {
                    let mut vm = vm;
                    vm.backfill(&self.model_init_values);
                    buffer.vms.insert(
                        vm.id().to_string(),
                        Buffered {
                            vm: vm.clone(),
                            pending: None,
                        },
                    );
                    vm
                }
            };
            seen.insert(vm.id().to_string());
            found.push(vm);
        }
        Ok(found)
    }

    /// Commits everything buffered during replay and leaves replay mode.
    ///
    /// Deletes are committed before creates and updates, so a
    /// delete-then-recreate within one run lands in that order. View models
    /// that were only read are not committed. The buffer is cleared and
    /// replay mode left even when a commit fails.
    #[tracing::instrument(skip(self), fields(collection = %self.name))]
    pub async fn save_replaying_vms(&self) -> Result<()> {
        if !self.is_replaying() {
            return Err(DenormalizerError::NotReplaying(self.name.clone()));
        }

        let buffer = std::mem::take(&mut *self.buffer.lock().await);
        let deletes: Vec<ViewModel> = buffer.to_delete.into_values().collect();
        let writes: Vec<ViewModel> = buffer
            .vms
            .into_values()
            .filter_map(|Buffered { mut vm, pending }| {
                let action = pending?;
                vm.set_action_on_commit(action);
                Some(vm)
            })
            .collect();
        tracing::debug!(
            deletes = deletes.len(),
            writes = writes.len(),
            "flushing replay buffer"
        );

        let result = match self.commit_all(deletes).await {
            Ok(()) => self.commit_all(writes).await,
            Err(e) => Err(e),
        };
        self.replaying.store(false, Ordering::SeqCst);

        if let Err(e) = &result {
            tracing::warn!(error = %e, "replay flush failed");
        }
        result
    }

    async fn commit_all(&self, vms: Vec<ViewModel>) -> Result<()> {
        if vms.is_empty() {
            return Ok(());
        }
        if self.repository.supports_bulk_commit() {
            return Ok(self.repository.bulk_commit(vms).await?);
        }
        for vm in vms {
            self.repository.commit(vm).await?;
        }
        Ok(())
    }

    /// Removes every view model of this collection.
    pub async fn clear(&self) -> Result<()> {
        *self.buffer.lock().await = ReplayBuffer::default();
        Ok(self.repository.clear().await?)
    }
}
