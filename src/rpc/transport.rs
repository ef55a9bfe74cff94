//! TCP transport layer.
//!
//! Server side: an accept loop that hands each accepted stream to a callback
//! and stops when its listener is closed through the owning [`Lifecycle`].
//! Client side: the [`Dialer`] seam used by consumers to open connections.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::lifecycle::{Lifecycle, Resource, ResourceKind};
use crate::logging::LogThrottle;

/// Pause after a failed accept so a persistent error (fd exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// A bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens connections to `host:port` targets.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Tracked handle for a running accept loop. Closing it stops the loop.
struct ListenerHandle {
    stop: CancellationToken,
}

impl Resource for ListenerHandle {
    fn close(&self) -> io::Result<()> {
        self.stop.cancel();
        Ok(())
    }
}

/// Accept connections until the listener is closed or shutdown begins.
///
/// The listener is tracked in `lifecycle` for as long as the loop runs. If
/// shutdown has already begun the listener is dropped right away.
pub async fn accept_loop<F>(
    lifecycle: Arc<Lifecycle>,
    listener: TcpListener,
    label: &'static str,
    mut on_conn: F,
) where
    F: FnMut(TcpStream, SocketAddr) + Send,
{
    let addr = listener.local_addr().ok();
    let stop = CancellationToken::new();
    let id = lifecycle.next_id();
    if lifecycle.is_shutting_down()
        || !lifecycle.track(id, ResourceKind::Listener, Arc::new(ListenerHandle { stop: stop.clone() }))
    {
        debug!(label, "not serving, shutdown in progress");
        return;
    }

    info!(label, addr = ?addr, "listening");
    let throttle = LogThrottle::new(Duration::from_secs(1));

    loop {
        if lifecycle.is_shutting_down() {
            break;
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if lifecycle.is_shutting_down() {
                        drop(stream);
                        break;
                    }
                    on_conn(stream, peer);
                }
                Err(e) => {
                    if let Some(suppressed) = throttle.admit() {
                        error!(label, error = %e, suppressed, "failed to accept connection");
                    }
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    drop(listener);
    lifecycle.untrack(id);
    info!(label, addr = ?addr, "listener closed");
}
