//! In-process registry.
//!
//! Keeps registrations in memory and answers blocking queries the way a
//! Consul agent does: every change bumps a global index, and a query waits
//! until the index reaches the caller's `wait_index` or the wait time
//! elapses. Used by tests and single-process setups.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Instance, Registration, Registry, RegistryError};

/// Default blocking-query wait.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct State {
    services: BTreeMap<String, Registration>,
    unavailable: bool,
}

pub struct SimulatedRegistry {
    state: Mutex<State>,
    index: watch::Sender<u64>,
    wait: Duration,
    queries: AtomicUsize,
}

impl Default for SimulatedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRegistry {
    pub fn new() -> Self {
        Self::with_wait(DEFAULT_WAIT)
    }

    pub fn with_wait(wait: Duration) -> Self {
        let (index, _) = watch::channel(1);
        Self {
            state: Mutex::new(State::default()),
            index,
            wait,
            queries: AtomicUsize::new(0),
        }
    }

    /// Register an instance of `name` directly.
    pub fn add_instance(&self, name: &str, instance: Instance) {
        let registration = Registration {
            id: instance.id,
            name: name.to_string(),
            address: instance.address,
            port: instance.port,
            check: None,
        };
        self.lock().services.insert(registration.id.clone(), registration);
        self.bump();
    }

    /// Remove an instance by id. Returns whether it existed.
    pub fn remove_instance(&self, id: &str) -> bool {
        let removed = self.lock().services.remove(id).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Current instances of `name`, sorted by id.
    pub fn instances(&self, name: &str) -> Vec<Instance> {
        self.lock()
            .services
            .values()
            .filter(|r| r.name == name)
            .map(Registration::instance)
            .collect()
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.lock().services.values().cloned().collect()
    }

    /// Make every query fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
        self.bump();
    }

    pub fn index(&self) -> u64 {
        *self.index.borrow()
    }

    /// Number of `find_instances` calls answered so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.index.send_modify(|index| *index += 1);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Registry for SimulatedRegistry {
    async fn register(&self, registration: &Registration) -> Result<(), RegistryError> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(RegistryError::Unavailable("simulated outage".into()));
            }
            state.services.insert(registration.id.clone(), registration.clone());
        }
        debug!(id = %registration.id, name = %registration.name, "registered");
        self.bump();
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        {
            let mut state = self.lock();
            if state.unavailable {
                return Err(RegistryError::Unavailable("simulated outage".into()));
            }
            state.services.remove(id);
        }
        debug!(id, "deregistered");
        self.bump();
        Ok(())
    }

    async fn find_instances(
        &self,
        name: &str,
        wait_index: u64,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Instance>, u64), RegistryError> {
        let mut index = self.index.subscribe();
        let deadline = tokio::time::Instant::now() + self.wait;

        loop {
            let current = *index.borrow_and_update();
            if wait_index == 0 || current >= wait_index {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => break,
                changed = index.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.lock().unavailable {
            return Err(RegistryError::Unavailable("simulated outage".into()));
        }
        Ok((self.instances(name), self.index()))
    }
}
