use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::registry::{Instance, Registry};

/// Cached instances of one provider name, refreshed by [`InstanceStore::watch`].
pub struct InstanceStore {
    provider_name: String,
    state: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    /// `None` until a watch succeeds, and again after one fails.
    instances: Option<Vec<Instance>>,
    idx: u64,
}

impl InstanceStore {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Current instances sorted by id, or `None` if unknown.
    pub fn instances(&self) -> Option<Vec<Instance>> {
        self.read().instances.clone()
    }

    /// Index passed to the next blocking query.
    pub fn index(&self) -> u64 {
        self.read().idx
    }

    /// Run one blocking query and apply its outcome.
    ///
    /// A failed or empty result clears the cached set and returns false.
    pub async fn watch(&self, registry: &dyn Registry, cancel: &CancellationToken) -> bool {
        let wait_index = self.index();
        debug!(provider = %self.provider_name, wait_index, "watching instances");

        let found = registry
            .find_instances(&self.provider_name, wait_index, cancel)
            .await;

        let mut state = self.write();
        match found {
            Err(e) => {
                error!(provider = %self.provider_name, error = %e, "instance query failed");
                state.instances = None;
                false
            }
            Ok((instances, _)) if instances.is_empty() => {
                warn!(provider = %self.provider_name, "provider has no instances");
                state.instances = None;
                false
            }
            Ok((mut instances, index)) => {
                instances.sort_by(|a, b| a.id.cmp(&b.id));
                debug!(provider = %self.provider_name, count = instances.len(), index, "instances updated");
                state.instances = Some(instances);
                // A smaller index means the registry was rebuilt; start over.
                state.idx = if index < state.idx { 0 } else { index + 1 };
                true
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
