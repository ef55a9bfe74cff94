//! TCP health check endpoint.
//!
//! The registry's TCP check only needs the port to accept connections, so
//! every accepted connection is dropped straight away.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::TcpListener;
use tracing::info;

use crate::config::CheckConfig;
use crate::lifecycle::{Lifecycle, ResourceKind};
use crate::registry::CheckDefinition;
use crate::rpc::transport::accept_loop;

pub struct HealthCheck {
    addr: String,
    config: CheckConfig,
    lifecycle: Arc<Lifecycle>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HealthCheck {
    pub fn new(host: &str, config: &CheckConfig) -> Self {
        Self {
            addr: format!("{}:{}", host, config.port),
            config: config.clone(),
            lifecycle: Arc::new(Lifecycle::new()),
            local_addr: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The check the registry should run against this endpoint.
    pub fn check_definition(&self) -> CheckDefinition {
        CheckDefinition {
            tcp: self.addr.clone(),
            timeout: self.config.timeout.clone(),
            interval: self.config.interval.clone(),
            deregister_critical_service_after: self.config.deregister_after.clone(),
        }
    }

    pub async fn listen_and_serve(&self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener)
    }

    pub fn serve(&self, listener: TcpListener) -> io::Result<SocketAddr> {
        if self.lifecycle.is_shutting_down() {
            return Err(io::Error::other("health check is shutting down"));
        }
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        tokio::spawn(accept_loop(self.lifecycle.clone(), listener, "health check", |stream, _| {
            drop(stream)
        }));
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting health check connections.
    pub fn shutdown(&self) -> io::Result<()> {
        if self.lifecycle.begin_shutdown() {
            info!(addr = %self.addr, "health check shutting down");
        }
        self.lifecycle.close_all(ResourceKind::Listener)
    }

    pub fn is_serving(&self) -> bool {
        self.lifecycle.count(ResourceKind::Listener) > 0
    }
}
