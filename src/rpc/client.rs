//! Client connections to one provider instance.
//!
//! An [`RpcClient`] keeps a small LIFO pool of idle connections to a single
//! instance. A call checks a connection out, performs one request/response
//! round trip and puts the connection back. A connection whose round trip
//! failed at the transport level, or that was abandoned mid-flight, is
//! dropped instead.
//!
//! The provider may close a pooled connection while it sits idle (a drain,
//! or a restart at the same address). When a pooled connection fails before
//! any response byte arrives, the call is sent once more on a fresh
//! connection. Failures on a fresh connection are returned as they are.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::debug;

use super::protocol::{FrameError, MAX_LINE_LEN, Request, Response, read_line_limited};
use super::transport::{Connection, Dialer};
use crate::lifecycle::Resource;

/// Idle connections kept per instance.
pub const MAX_IDLE_CONNS: usize = 8;

type PooledConn = BufReader<Box<dyn Connection>>;

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client for {0} is closed")]
    Closed(String),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("response line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("connection to {0} closed before a response arrived")]
    Eof(String),

    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: Value },

    /// The provider answered with an error message.
    #[error("{0}")]
    Rpc(String),
}

pub struct RpcClient {
    addr: String,
    dialer: Arc<dyn Dialer>,
    idle: Mutex<Vec<PooledConn>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            addr: addr.into(),
            dialer,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn idle_connections(&self) -> usize {
        self.lock_idle().len()
    }

    /// Call `service_method` with `param` as its single argument.
    pub async fn call(&self, service_method: &str, param: Value) -> Result<Value, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed(self.addr.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = Request::call(service_method, param, Value::from(id));
        let mut frame = serde_json::to_vec(&request).map_err(ClientError::Serialize)?;
        frame.push(b'\n');

        let (mut conn, pooled) = match self.checkout() {
            Some(conn) => (conn, true),
            None => (self.connect().await?, false),
        };
        let reply = match self.round_trip(&mut conn, &frame).await {
            Err(RoundTripError { source, received: false }) if pooled => {
                debug!(addr = %self.addr, error = %source, "pooled connection is stale, redialing");
                conn = self.connect().await?;
                self.round_trip(&mut conn, &frame).await
            }
            reply => reply,
        };
        let response_line = reply.map_err(|e| e.source)?;

        let response: Response =
            serde_json::from_str(&response_line).map_err(ClientError::Parse)?;
        if response.id != Value::from(id) {
            return Err(ClientError::IdMismatch {
                expected: id,
                got: response.id,
            });
        }

        // The stream is in sync again, so the connection can be reused.
        self.checkin(conn);

        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Drop every pooled connection and refuse further calls.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let dropped = std::mem::take(&mut *self.lock_idle());
            debug!(addr = %self.addr, idle = dropped.len(), "client closed");
        }
    }

    /// Send one request frame and read one response line.
    async fn round_trip(&self, conn: &mut PooledConn, frame: &[u8]) -> Result<String, RoundTripError> {
        let unanswered = |e: io::Error| RoundTripError {
            source: e.into(),
            received: false,
        };
        conn.write_all(frame).await.map_err(unanswered)?;
        conn.flush().await.map_err(unanswered)?;

        let mut line = String::new();
        match read_line_limited(conn, &mut line, MAX_LINE_LEN).await {
            Ok(0) => Err(RoundTripError {
                source: ClientError::Eof(self.addr.clone()),
                received: false,
            }),
            Ok(_) => Ok(line),
            Err(e) => Err(RoundTripError {
                received: !line.is_empty(),
                source: match e {
                    FrameError::TooLong(max) => ClientError::LineTooLong(max),
                    FrameError::Io(e) => ClientError::Io(e),
                },
            }),
        }
    }

    async fn connect(&self) -> Result<PooledConn, ClientError> {
        let stream = self
            .dialer
            .dial(&self.addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        debug!(addr = %self.addr, "connected");
        Ok(BufReader::new(stream))
    }

    fn checkout(&self) -> Option<PooledConn> {
        self.lock_idle().pop()
    }

    fn checkin(&self, conn: PooledConn) {
        let mut idle = self.lock_idle();
        if !self.is_closed() && idle.len() < MAX_IDLE_CONNS {
            idle.push(conn);
        }
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<PooledConn>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A failed round trip. `received` tells whether any response bytes had
/// arrived before the failure.
struct RoundTripError {
    source: ClientError,
    received: bool,
}

impl Resource for RpcClient {
    fn close(&self) -> io::Result<()> {
        RpcClient::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Hands out in-memory streams served by `serve`.
    struct DuplexDialer {
        dials: AtomicUsize,
        reply: fn(Request) -> Option<String>,
        /// Requests served per connection before the server hangs up.
        per_conn: usize,
    }

    #[async_trait]
    impl Dialer for DuplexDialer {
        async fn dial(&self, _addr: &str) -> io::Result<Box<dyn Connection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(4096);
            tokio::spawn(serve(server, self.reply, self.per_conn));
            Ok(Box::new(client))
        }
    }

    async fn serve(stream: DuplexStream, reply: fn(Request) -> Option<String>, per_conn: usize) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        for _ in 0..per_conn {
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let request: Request = serde_json::from_str(&line).unwrap();
            line.clear();
            match reply(request) {
                Some(out) => {
                    writer.write_all(out.as_bytes()).await.unwrap();
                    writer.write_all(b"\n").await.unwrap();
                }
                None => return,
            }
        }
    }

    fn echo(request: Request) -> Option<String> {
        let params = request.params.unwrap();
        let response = if params[0]["fail"] == json!(true) {
            Response::error(request.id.unwrap(), "remote failure")
        } else {
            Response::success(request.id.unwrap(), params[0].clone())
        };
        Some(serde_json::to_string(&response).unwrap())
    }

    fn client(reply: fn(Request) -> Option<String>) -> (RpcClient, Arc<DuplexDialer>) {
        client_with_limit(reply, usize::MAX)
    }

    fn client_with_limit(
        reply: fn(Request) -> Option<String>,
        per_conn: usize,
    ) -> (RpcClient, Arc<DuplexDialer>) {
        let dialer = Arc::new(DuplexDialer {
            dials: AtomicUsize::new(0),
            reply,
            per_conn,
        });
        (RpcClient::new("10.0.0.1:8888", dialer.clone()), dialer)
    }

    #[tokio::test]
    async fn test_call_reuses_pooled_connection() {
        let (client, dialer) = client(echo);

        let first = client.call("svc.Echo", json!({"n": 1})).await.unwrap();
        let second = client.call("svc.Echo", json!({"n": 2})).await.unwrap();
        assert_eq!(first, json!({"n": 1}));
        assert_eq!(second, json!({"n": 2}));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert_eq!(client.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_keeps_connection() {
        let (client, dialer) = client(echo);

        let err = client.call("svc.Echo", json!({"fail": true})).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(ref msg) if msg == "remote failure"));

        client.call("svc.Echo", json!({})).await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hangup_drops_connection() {
        let (client, dialer) = client(|_| None);

        let err = client.call("svc.Echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Eof(_)));
        assert_eq!(client.idle_connections(), 0);
        // A fresh connection that fails is not dialed again.
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        client.call("svc.Echo", json!({})).await.unwrap_err();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_pooled_connection_is_redialed() {
        let (client, dialer) = client_with_limit(echo, 1);

        client.call("svc.Echo", json!({"n": 1})).await.unwrap();
        assert_eq!(client.idle_connections(), 1);
        // Let the server side of the pooled connection hang up.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let second = client.call("svc.Echo", json!({"n": 2})).await.unwrap();
        assert_eq!(second, json!({"n": 2}));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_overlong_reply_fails_call() {
        let (client, dialer) = client(|_| Some("x".repeat(MAX_LINE_LEN + 1)));

        let err = client.call("svc.Echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::LineTooLong(MAX_LINE_LEN)));
        assert_eq!(client.idle_connections(), 0);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_client_refuses_calls() {
        let (client, dialer) = client(echo);
        client.call("svc.Echo", json!({})).await.unwrap();

        client.close();
        assert_eq!(client.idle_connections(), 0);
        let err = client.call("svc.Echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed(_)));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }
}
