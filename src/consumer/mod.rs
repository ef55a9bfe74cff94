//! Consumer side: instance discovery and typed stubs.
//!
//! A [`Consumer`] keeps one [`InstanceStore`] and one background watch task
//! per subscribed provider name, one pooled [`RpcClient`] per known instance,
//! and the shutdown state shared by every stub it handed out.

mod contract;
mod error;
mod method_info;
mod store;
mod stub;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use contract::{Binder, Contract, ContractError, Shape, shape_of};
pub use error::{CallError, ConsumerError, RpcError};
pub use method_info::{DEFAULT_LOAD_BALANCE, DEFAULT_TIMEOUT, MethodInfo};
pub use store::InstanceStore;
pub use stub::Stub;

use crate::config::ConsumerConfig;
use crate::lifecycle::{Lifecycle, ResourceId, ResourceKind};
use crate::loadbalance::BalancerRegistry;
use crate::registry::{Instance, Registry};
use crate::rpc::{Dialer, RpcClient, TcpDialer};

/// Default pause before re-watching after a failed or empty query.
pub const DEFAULT_WATCH_RETRY: Duration = Duration::from_secs(5);

pub struct ConsumerBuilder {
    config: ConsumerConfig,
    registry: Arc<dyn Registry>,
    dialer: Arc<dyn Dialer>,
    balancers: BalancerRegistry,
    watch_retry: Duration,
}

impl ConsumerBuilder {
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn balancers(mut self, balancers: BalancerRegistry) -> Self {
        self.balancers = balancers;
        self
    }

    pub fn watch_retry(mut self, watch_retry: Duration) -> Self {
        self.watch_retry = watch_retry;
        self
    }

    pub fn build(self) -> Consumer {
        Consumer {
            inner: Arc::new(ConsumerInner {
                config: self.config,
                registry: self.registry,
                dialer: self.dialer,
                balancers: self.balancers,
                watch_retry: self.watch_retry,
                lifecycle: Lifecycle::new(),
                root: CancellationToken::new(),
                watchers: TaskTracker::new(),
                stores: RwLock::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }
}

pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

type ClientMap = HashMap<String, HashMap<String, (ResourceId, Arc<RpcClient>)>>;

pub(crate) struct ConsumerInner {
    config: ConsumerConfig,
    registry: Arc<dyn Registry>,
    dialer: Arc<dyn Dialer>,
    balancers: BalancerRegistry,
    watch_retry: Duration,
    lifecycle: Lifecycle,
    /// Parent of every watch task and call attempt.
    root: CancellationToken,
    watchers: TaskTracker,
    stores: RwLock<HashMap<String, Arc<InstanceStore>>>,
    /// provider name -> instance id -> client
    clients: Mutex<ClientMap>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, registry: Arc<dyn Registry>) -> Self {
        Self::builder(config, registry).build()
    }

    pub fn builder(config: ConsumerConfig, registry: Arc<dyn Registry>) -> ConsumerBuilder {
        ConsumerBuilder {
            config,
            registry,
            dialer: Arc::new(TcpDialer),
            balancers: BalancerRegistry::new(),
            watch_retry: DEFAULT_WATCH_RETRY,
        }
    }

    /// Bind contract `C` against `provider_name` and start watching the
    /// provider's instances.
    ///
    /// Slots that fail validation are logged and left unbound; see
    /// [`Consumer::bind_contract`] to inspect those errors.
    pub fn register_consumer<C: Contract>(&self, provider_name: &str) -> Result<C, ConsumerError> {
        self.bind_contract(provider_name).map(|(contract, _)| contract)
    }

    /// Like [`Consumer::register_consumer`], also returning the validation
    /// errors of slots that could not be bound.
    pub fn bind_contract<C: Contract>(
        &self,
        provider_name: &str,
    ) -> Result<(C, Vec<ContractError>), ConsumerError> {
        if provider_name.is_empty() {
            return Err(ConsumerError::EmptyProviderName);
        }
        if self.is_shutting_down() {
            return Err(ConsumerError::ShuttingDown);
        }

        let mut binder = Binder::new(&self.inner, provider_name);
        let contract = C::bind(&mut binder);
        let errors = binder.into_errors();

        self.inner.subscribe(provider_name);
        Ok((contract, errors))
    }

    /// Cached instances of `provider_name`, if it is subscribed and known.
    pub fn instances(&self, provider_name: &str) -> Option<Vec<Instance>> {
        self.inner.store(provider_name).and_then(|store| store.instances())
    }

    /// Wait until at least one instance of `provider_name` is known.
    pub async fn wait_for_instances(&self, provider_name: &str, timeout: Duration) -> bool {
        let ready = async {
            while !self
                .instances(provider_name)
                .is_some_and(|set| !set.is_empty())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, ready).await.is_ok()
    }

    /// Strategy table used by this consumer's stubs.
    pub fn balancers(&self) -> &BalancerRegistry {
        &self.inner.balancers
    }

    /// Number of instance clients currently open.
    pub fn open_clients(&self) -> usize {
        self.inner.lifecycle.count(ResourceKind::Client)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Stop the consumer: fail new calls, close every instance client,
    /// cancel watch tasks and in-flight attempts, and wait for the watchers
    /// to exit.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.lifecycle.begin_shutdown() {
            info!("consumer shutting down");
        }

        if let Err(e) = inner.lifecycle.close_all(ResourceKind::Client) {
            warn!(error = %e, "error closing client");
        }
        let clients = std::mem::take(&mut *inner.lock_clients());
        for (id, _) in clients.into_values().flat_map(HashMap::into_values) {
            inner.lifecycle.untrack(id);
        }

        inner.root.cancel();
        inner.registry.close_idle_connections();

        inner.watchers.close();
        inner.watchers.wait().await;
        debug!("consumer stopped");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.inner.lifecycle.begin_shutdown();
        self.inner.root.cancel();
    }
}

impl ConsumerInner {
    fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    fn store(&self, provider_name: &str) -> Option<Arc<InstanceStore>> {
        self.stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider_name)
            .cloned()
    }

    /// Create the store for `provider_name` and start its watcher, once.
    fn subscribe(self: &Arc<Self>, provider_name: &str) {
        let store = {
            let mut stores = self.stores.write().unwrap_or_else(PoisonError::into_inner);
            if stores.contains_key(provider_name) {
                return;
            }
            let store = Arc::new(InstanceStore::new(provider_name));
            stores.insert(provider_name.to_string(), store.clone());
            store
        };

        let cancel = self.root.child_token();
        self.watchers.spawn(watch_loop(self.clone(), store, cancel));
    }

    /// One call attempt: discovery, balancing, then the round trip.
    async fn invoke(
        &self,
        info: &MethodInfo,
        service_method: &str,
        param: Value,
    ) -> Result<Value, CallError> {
        let store = self
            .store(&info.provider_name)
            .ok_or_else(|| CallError::UnknownProvider(info.provider_name.clone()))?;
        let mut candidates = store
            .instances()
            .filter(|set| !set.is_empty())
            .ok_or_else(|| CallError::ZeroInstances(info.provider_name.clone()))?;

        let instance = self.balancers.select(&info.load_balance, &mut candidates)?;
        let client = self.client_for(&info.provider_name, &instance)?;
        Ok(client.call(service_method, param).await?)
    }

    fn client_for(&self, provider_name: &str, instance: &Instance) -> Result<Arc<RpcClient>, CallError> {
        let target = instance.target();
        let mut clients = self.lock_clients();
        let per_provider = clients.entry(provider_name.to_string()).or_default();

        match per_provider.get(&instance.id) {
            Some((_, client)) if client.addr() == target => return Ok(client.clone()),
            _ => {}
        }
        // Same instance id re-registered at a new address.
        if let Some((id, stale)) = per_provider.remove(&instance.id) {
            stale.close();
            self.lifecycle.untrack(id);
        }

        let client = Arc::new(RpcClient::new(target, self.dialer.clone()));
        let id = self.lifecycle.next_id();
        if !self.lifecycle.track(id, ResourceKind::Client, client.clone()) {
            return Err(CallError::ShuttingDown);
        }
        per_provider.insert(instance.id.clone(), (id, client.clone()));
        Ok(client)
    }

    /// Close clients of instances the store no longer lists.
    fn prune_clients(&self, store: &InstanceStore) {
        let live: HashSet<String> = store
            .instances()
            .unwrap_or_default()
            .into_iter()
            .map(|i| i.id)
            .collect();

        let mut clients = self.lock_clients();
        let Some(per_provider) = clients.get_mut(store.provider_name()) else {
            return;
        };
        per_provider.retain(|instance_id, (id, client)| {
            if live.contains(instance_id) {
                return true;
            }
            debug!(provider = %store.provider_name(), instance = %instance_id, "closing client of removed instance");
            client.close();
            self.lifecycle.untrack(*id);
            false
        });
    }

    fn lock_clients(&self) -> MutexGuard<'_, ClientMap> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn watch_loop(inner: Arc<ConsumerInner>, store: Arc<InstanceStore>, cancel: CancellationToken) {
    info!(provider = %store.provider_name(), "instance watcher started");

    loop {
        let found = tokio::select! {
            _ = cancel.cancelled() => break,
            found = store.watch(inner.registry.as_ref(), &cancel) => found,
        };
        if cancel.is_cancelled() {
            break;
        }
        inner.prune_clients(&store);

        if !found {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(inner.watch_retry) => {}
            }
        }
    }

    debug!(provider = %store.provider_name(), "instance watcher stopped");
}
