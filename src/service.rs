//! Application service composition.
//!
//! A [`Service`] ties one process's pieces together: the registry client
//! from the [`AppContext`], a health check endpoint, and optionally a
//! provider and a consumer.
//!
//! Startup: `init_provider` / `init_consumer`, register methods and
//! contracts, then `listen_and_serve` registers the instance, starts the
//! health check and finally the provider. Shutdown runs the other way:
//! consumer, health check, then provider (which deregisters itself).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::consumer::{Consumer, Contract};
use crate::context::AppContext;
use crate::health::HealthCheck;
use crate::net::local_ipv4;
use crate::provider::Provider;
use crate::registry::Registration;
use crate::rpc::MethodSet;

pub struct Service {
    ctx: AppContext,
    name: String,
    host: String,
    health: HealthCheck,
    provider: Option<Provider>,
    consumer: Option<Consumer>,
    registered: AtomicBool,
}

impl Service {
    pub fn new(ctx: AppContext) -> Result<Self> {
        let config = &ctx.config;
        let host = if config.service.host.is_empty() {
            local_ipv4()
                .context("failed to detect a local IPv4 address")?
                .to_string()
        } else {
            config.service.host.clone()
        };
        let health = HealthCheck::new(&host, &config.check);

        Ok(Self {
            name: config.service.name.clone(),
            host,
            health,
            provider: None,
            consumer: None,
            registered: AtomicBool::new(false),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.ctx.config.provider.port
    }

    /// Registry id of this instance: `name-host:port`.
    pub fn id(&self) -> String {
        format!("{}-{}:{}", self.name, self.host, self.port())
    }

    pub fn provider(&self) -> Option<&Provider> {
        self.provider.as_ref()
    }

    pub fn consumer(&self) -> Option<&Consumer> {
        self.consumer.as_ref()
    }

    pub fn health(&self) -> &HealthCheck {
        &self.health
    }

    pub fn init_provider(&mut self) {
        let addr = format!("{}:{}", self.host, self.port());
        self.provider = Some(Provider::new(self.id(), addr, self.ctx.registry.clone()));
    }

    pub fn init_consumer(&mut self) {
        let consumer = Consumer::builder(self.ctx.config.consumer.clone(), self.ctx.registry.clone())
            .watch_retry(self.ctx.config.registry.watch_retry())
            .build();
        self.consumer = Some(consumer);
    }

    /// Expose `methods` under this service's name.
    pub fn register_provider(&self, methods: MethodSet) -> Result<()> {
        if self.name.is_empty() {
            bail!("service name is blank");
        }
        let Some(provider) = &self.provider else {
            bail!("provider is not initialized");
        };
        provider
            .register(&self.name, methods)
            .with_context(|| format!("failed to register provider {}", self.name))
    }

    pub fn register_consumer<C: Contract>(&self, provider_name: &str) -> Result<C> {
        let Some(consumer) = &self.consumer else {
            bail!("consumer is not initialized");
        };
        consumer
            .register_consumer(provider_name)
            .with_context(|| format!("failed to subscribe to {provider_name}"))
    }

    /// The registration advertised for this instance.
    pub fn registration(&self) -> Registration {
        Registration {
            id: self.id(),
            name: self.name.clone(),
            address: self.host.clone(),
            port: self.port(),
            check: Some(self.health.check_definition()),
        }
    }

    /// Register with the registry and start the health check and provider.
    ///
    /// Returns the provider's listening address, if there is a provider.
    pub async fn listen_and_serve(&self) -> Result<Option<SocketAddr>> {
        let registration = self.registration();
        self.ctx
            .registry
            .register(&registration)
            .await
            .with_context(|| format!("failed to register {}", registration.id))?;
        self.registered.store(true, Ordering::SeqCst);
        info!(id = %registration.id, "registered service");

        let check_addr = self
            .health
            .listen_and_serve()
            .await
            .with_context(|| format!("failed to start health check on {}", self.health.addr()))?;
        info!(addr = %check_addr, "health check listening");

        let Some(provider) = &self.provider else {
            return Ok(None);
        };
        let addr = provider.listen_and_serve().await?;
        info!(addr = %addr, name = %self.name, "provider serving");
        Ok(Some(addr))
    }

    /// Stop everything, bounded by `cancel` for the provider drain.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        if let Some(consumer) = &self.consumer {
            consumer.shutdown().await;
        }
        if let Err(e) = self.health.shutdown() {
            warn!(error = %e, "failed to close health check");
        }

        match &self.provider {
            Some(provider) => provider
                .shutdown(cancel)
                .await
                .context("provider shutdown did not complete")?,
            None if self.registered.load(Ordering::SeqCst) => {
                let id = self.id();
                if let Err(e) = self.ctx.registry.deregister(&id).await {
                    warn!(id = %id, error = %e, "failed to deregister service");
                }
                self.ctx.registry.close_idle_connections();
            }
            None => self.ctx.registry.close_idle_connections(),
        }
        info!(name = %self.name, "service stopped");
        Ok(())
    }

    /// Wait up to `timeout` for `provider_name` to have a known instance.
    pub async fn wait_for_provider(&self, provider_name: &str, timeout: Duration) -> bool {
        match &self.consumer {
            Some(consumer) => consumer.wait_for_instances(provider_name, timeout).await,
            None => false,
        }
    }
}
