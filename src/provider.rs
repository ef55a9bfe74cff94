//! Provider side: serves registered methods over TCP.
//!
//! Every accepted connection gets a [`ServerCodec`] and a task reading
//! requests from it. Each request then runs in its own task so a slow method
//! does not hold up the rest of the connection.
//!
//! ## Shutdown
//!
//! 1. flag shutdown, so no new listener or codec is tracked
//! 2. deregister from the registry
//! 3. close listeners
//! 4. close codecs that are idle
//! 5. wait for in-flight requests
//! 6. poll until every codec has closed

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{Lifecycle, LifecycleError, Resource, ResourceKind};
use crate::registry::Registry;
use crate::rpc::codec::{ServerCodec, ServerRequest};
use crate::rpc::methods::{MethodRegistry, MethodSet};
use crate::rpc::transport::accept_loop;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider name must not be empty")]
    EmptyName,

    #[error("provider {0} has no methods")]
    NoMethods(String),

    #[error("rpc: service already defined: {0}")]
    Duplicate(String),

    #[error("provider is shutting down")]
    ShuttingDown,

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

pub struct Provider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    id: String,
    addr: String,
    registry: Arc<dyn Registry>,
    methods: MethodRegistry,
    lifecycle: Arc<Lifecycle>,
    /// In-flight request handlers.
    requests: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Provider {
    /// `id` is the instance id used for deregistration; `addr` the
    /// `host:port` to listen on.
    pub fn new(id: impl Into<String>, addr: impl Into<String>, registry: Arc<dyn Registry>) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                id: id.into(),
                addr: addr.into(),
                registry,
                methods: MethodRegistry::new(),
                lifecycle: Arc::new(Lifecycle::new()),
                requests: TaskTracker::new(),
                local_addr: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Expose `methods` under `name`.
    pub fn register(&self, name: &str, methods: MethodSet) -> Result<(), ProviderError> {
        let count = methods.len();
        self.inner.methods.register(name, methods)?;
        info!(provider = %name, methods = count, "registered provider");
        Ok(())
    }

    /// Bind the configured address and start serving in the background.
    pub async fn listen_and_serve(&self) -> Result<SocketAddr, ProviderError> {
        if self.inner.lifecycle.is_shutting_down() {
            return Err(ProviderError::ShuttingDown);
        }
        let listener = TcpListener::bind(&self.inner.addr)
            .await
            .map_err(|source| ProviderError::Bind {
                addr: self.inner.addr.clone(),
                source,
            })?;
        self.serve(listener)
    }

    /// Serve on an already bound listener.
    pub fn serve(&self, listener: TcpListener) -> Result<SocketAddr, ProviderError> {
        if self.inner.lifecycle.is_shutting_down() {
            return Err(ProviderError::ShuttingDown);
        }
        let local_addr = listener.local_addr().map_err(|source| ProviderError::Bind {
            addr: self.inner.addr.clone(),
            source,
        })?;
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        let inner = self.inner.clone();
        tokio::spawn(accept_loop(
            self.inner.lifecycle.clone(),
            listener,
            "provider",
            move |stream, peer| inner.accept(stream, peer),
        ));
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of client connections currently open.
    pub fn open_connections(&self) -> usize {
        self.inner.lifecycle.count(ResourceKind::Codec)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lifecycle.is_shutting_down()
    }

    /// Gracefully stop serving.
    ///
    /// Returns once every listener and connection is closed, or with
    /// [`LifecycleError::Cancelled`] if `cancel` fires first.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let inner = &self.inner;
        let lifecycle = &inner.lifecycle;
        lifecycle.begin_shutdown();
        info!(id = %inner.id, "provider shutting down");

        if let Err(e) = inner.registry.deregister(&inner.id).await {
            warn!(id = %inner.id, error = %e, "failed to deregister provider");
        }
        inner.registry.close_idle_connections();

        let listener_result = lifecycle.close_all(ResourceKind::Listener);
        if let Err(e) = lifecycle.close_idle(ResourceKind::Codec) {
            debug!(error = %e, "error closing idle codec");
        }

        inner.requests.close();
        tokio::select! {
            _ = cancel.cancelled() => return Err(lifecycle.cancelled_error().into()),
            _ = inner.requests.wait() => {}
        }

        lifecycle.drain(cancel).await?;
        listener_result.map_err(|e| LifecycleError::Listener(e).into())
    }
}

impl ProviderInner {
    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let Some(codec) = ServerCodec::tracked(stream, &self.lifecycle) else {
            debug!(peer = %peer, "rejecting connection, shutdown in progress");
            return;
        };
        tokio::spawn(self.clone().serve_connection(codec, peer));
    }

    async fn serve_connection(self: Arc<Self>, codec: Arc<ServerCodec<TcpStream>>, peer: SocketAddr) {
        debug!(peer = %peer, "client connected");
        let in_flight = TaskTracker::new();

        loop {
            let request = match codec.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "closing connection");
                    break;
                }
            };

            let inner = self.clone();
            let codec = codec.clone();
            self.requests.spawn(in_flight.track_future(async move {
                let ServerRequest { seq, method, params } = request;
                let reply = inner.call_method(&method, params).await;
                if let Err(e) = codec.write_response(seq, reply).await {
                    warn!(peer = %peer, method = %method, error = %e, "failed to write response");
                }
            }));
        }

        in_flight.close();
        in_flight.wait().await;
        if let Err(e) = codec.close() {
            debug!(peer = %peer, error = %e, "error closing codec");
        }
        codec.shutdown_write().await;
        debug!(peer = %peer, "client disconnected");
    }

    /// Run a method in its own task so a panic becomes an error reply.
    async fn call_method(self: &Arc<Self>, method: &str, params: Option<Value>) -> Result<Value, String> {
        let inner = self.clone();
        let name = method.to_string();
        match tokio::spawn(async move { inner.methods.dispatch(&name, params).await }).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(method, error = %e, "rpc method panicked");
                Err(format!("rpc: method {method} panicked"))
            }
        }
    }
}
