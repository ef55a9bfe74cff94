use std::sync::Arc;

use crate::config::AppConfig;
use crate::registry::{ConsulRegistry, Registry};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<dyn Registry>,
}

impl AppContext {
    pub fn new(config: AppConfig, registry: Arc<dyn Registry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    /// Context backed by the Consul agent named in the config.
    pub fn with_consul(config: AppConfig) -> Self {
        let registry = ConsulRegistry::new(&config.registry.address, config.registry.wait());
        Self::new(config, Arc::new(registry))
    }
}
