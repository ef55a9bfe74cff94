//! Server-side wire codec.
//!
//! Callers may use any JSON value as a request id, while the serving layer
//! correlates responses with a dense `u64`. The codec assigns a sequence
//! number to every decoded request and keeps the caller's id in a pending map
//! until the matching response is written.
//!
//! The codec also records the connection state so a draining provider can
//! tell which connections are safe to close.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use super::protocol::{FrameError, MAX_LINE_LEN, Request, Response, read_line_limited};
use crate::lifecycle::{Lifecycle, Resource, ResourceId, ResourceKind};

/// How long an accepted connection may sit unused before a drain treats it
/// as idle.
pub const NEW_CONN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("jsonrpc: request body missing params")]
    MissingParams,

    #[error("invalid sequence number in response: {0}")]
    UnknownSequence(u64),

    #[error("request line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("invalid request envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("cannot decode request body: {0}")]
    Body(#[source] serde_json::Error),

    #[error("cannot encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FrameError> for CodecError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::TooLong(max) => CodecError::LineTooLong(max),
            FrameError::Io(e) => CodecError::Io(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Active,
    Idle,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct StateStamp {
    state: ConnState,
    unix_secs: i64,
}

/// A decoded request as seen by the serving layer.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub seq: u64,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Default)]
struct Pending {
    seq: u64,
    ids: HashMap<u64, Option<Value>>,
}

struct Registration {
    lifecycle: Weak<Lifecycle>,
    id: ResourceId,
}

pub struct ServerCodec<S> {
    reader: tokio::sync::Mutex<BufReader<ReadHalf<S>>>,
    writer: tokio::sync::Mutex<WriteHalf<S>>,
    pending: Mutex<Pending>,
    state: Mutex<StateStamp>,
    closed: AtomicBool,
    closing: CancellationToken,
    registration: Mutex<Option<Registration>>,
    max_line: usize,
}

impl<S> ServerCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S) -> Arc<Self> {
        Self::with_max_line(stream, MAX_LINE_LEN)
    }

    /// Like [`ServerCodec::new`], rejecting request lines longer than
    /// `max_line` bytes.
    pub fn with_max_line(stream: S, max_line: usize) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            reader: tokio::sync::Mutex::new(BufReader::new(reader)),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(Pending::default()),
            state: Mutex::new(StateStamp {
                state: ConnState::New,
                unix_secs: now_unix(),
            }),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
            registration: Mutex::new(None),
            max_line,
        })
    }

    /// Wrap `stream` and track the codec in `lifecycle`.
    ///
    /// Returns `None` when the lifecycle is shutting down; the stream is
    /// dropped in that case.
    pub fn tracked(stream: S, lifecycle: &Arc<Lifecycle>) -> Option<Arc<Self>> {
        let codec = Self::new(stream);
        let id = lifecycle.next_id();
        *lock(&codec.registration) = Some(Registration {
            lifecycle: Arc::downgrade(lifecycle),
            id,
        });

        if !lifecycle.track(id, ResourceKind::Codec, codec.clone()) {
            lock(&codec.registration).take();
            codec.mark_closed();
            return None;
        }
        Some(codec)
    }

    /// Read the next request.
    ///
    /// Returns `Ok(None)` at end of stream or once the codec is closed.
    /// Blank lines are skipped.
    pub async fn read_request(&self) -> Result<Option<ServerRequest>, CodecError> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();

        loop {
            if self.is_closed() {
                return Ok(None);
            }
            line.clear();
            let read = tokio::select! {
                _ = self.closing.cancelled() => return Ok(None),
                read = read_line_limited(&mut *reader, &mut line, self.max_line) => read?,
            };
            if read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let request: Request = serde_json::from_str(line.trim()).map_err(CodecError::Envelope)?;

        {
            let mut state = lock(&self.state);
            if state.state == ConnState::Closed {
                return Ok(None);
            }
            *state = StateStamp {
                state: ConnState::Active,
                unix_secs: now_unix(),
            };
        }

        let seq = {
            let mut pending = lock(&self.pending);
            pending.seq += 1;
            let seq = pending.seq;
            pending.ids.insert(seq, request.id);
            seq
        };

        Ok(Some(ServerRequest {
            seq,
            method: request.method,
            params: request.params,
        }))
    }

    /// Write the response for `seq`.
    ///
    /// Fails with [`CodecError::UnknownSequence`] if `seq` was never handed
    /// out or was already answered.
    pub async fn write_response(
        &self,
        seq: u64,
        reply: Result<Value, String>,
    ) -> Result<(), CodecError> {
        let id = lock(&self.pending)
            .ids
            .remove(&seq)
            .ok_or(CodecError::UnknownSequence(seq))?
            .unwrap_or(Value::Null);

        let response = match reply {
            Ok(result) => Response::success(id, result),
            Err(message) => Response::error(id, message),
        };
        let mut line = serde_json::to_vec(&response).map_err(CodecError::Encode)?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&line).await?;
            writer.flush().await?;
        }

        self.set_state(ConnState::Idle);
        Ok(())
    }

    /// Shut down the write half so the peer sees end of stream.
    pub async fn shutdown_write(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }

    pub fn state(&self) -> ConnState {
        lock(&self.state).state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of decoded requests that have not been answered yet.
    pub fn pending(&self) -> usize {
        lock(&self.pending).ids.len()
    }

    fn set_state(&self, next: ConnState) {
        let mut state = lock(&self.state);
        if state.state == ConnState::Closed {
            return;
        }
        *state = StateStamp {
            state: next,
            unix_secs: now_unix(),
        };
    }

    /// Flag the codec closed and wake a blocked reader. Returns false if it
    /// was closed already.
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.closing.cancel();
        let mut state = lock(&self.state);
        *state = StateStamp {
            state: ConnState::Closed,
            unix_secs: now_unix(),
        };
        true
    }

    fn untrack(&self) {
        if let Some(registration) = lock(&self.registration).take() {
            if let Some(lifecycle) = registration.lifecycle.upgrade() {
                lifecycle.untrack(registration.id);
            }
        }
    }

    #[cfg(test)]
    fn set_state_at(&self, state: ConnState, unix_secs: i64) {
        *lock(&self.state) = StateStamp { state, unix_secs };
    }
}

impl<S> Resource for ServerCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn close(&self) -> io::Result<()> {
        if self.mark_closed() {
            self.untrack();
        }
        Ok(())
    }

    fn close_if_idle(&self) -> io::Result<bool> {
        if self.is_closed() {
            return Ok(true);
        }

        let StateStamp {
            mut state,
            unix_secs,
        } = *lock(&self.state);

        // A connection that never sent anything is idle after the grace period.
        if state == ConnState::New && unix_secs < now_unix() - NEW_CONN_GRACE.as_secs() as i64 {
            state = ConnState::Idle;
        }
        if state != ConnState::Idle || unix_secs == 0 {
            return Ok(false);
        }

        self.close()?;
        Ok(true)
    }
}

/// Decode the single argument carried in a request's params.
///
/// Params must be present and hold a one-element array; the element is
/// deserialized into `T`.
pub fn decode_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, CodecError> {
    let params = match params {
        None | Some(Value::Null) => return Err(CodecError::MissingParams),
        Some(params) => params,
    };
    let (value,): (T,) = serde_json::from_value(params).map_err(CodecError::Body)?;
    Ok(value)
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    async fn send(client: &mut DuplexStream, line: &str) {
        client.write_all(line.as_bytes()).await.unwrap();
        client.write_all(b"\n").await.unwrap();
    }

    async fn recv(client: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_sequence_numbers_restore_original_ids() {
        let (mut client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::new(server);

        send(&mut client, r#"{"method":"svc.A","params":[{}],"id":"abc"}"#).await;
        send(&mut client, r#"{"method":"svc.B","params":[{}],"id":null}"#).await;
        send(&mut client, r#"{"method":"svc.C","params":[{}]}"#).await;

        let a = codec.read_request().await.unwrap().unwrap();
        let b = codec.read_request().await.unwrap().unwrap();
        let c = codec.read_request().await.unwrap().unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 3));
        assert_eq!(a.method, "svc.A");
        assert_eq!(codec.pending(), 3);

        // Answer out of order.
        codec.write_response(b.seq, Ok(json!(2))).await.unwrap();
        codec.write_response(a.seq, Ok(json!(1))).await.unwrap();
        codec.write_response(c.seq, Err("nope".into())).await.unwrap();
        assert_eq!(codec.pending(), 0);

        let mut client = BufReader::new(client);
        assert_eq!(recv(&mut client).await, json!({"id": null, "result": 2}));
        assert_eq!(recv(&mut client).await, json!({"id": "abc", "result": 1}));
        assert_eq!(recv(&mut client).await, json!({"id": null, "error": "nope"}));
    }

    #[tokio::test]
    async fn test_response_for_unknown_sequence_fails() {
        let (mut client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::new(server);

        let err = codec.write_response(1, Ok(json!(null))).await.unwrap_err();
        assert!(matches!(err, CodecError::UnknownSequence(1)));

        send(&mut client, r#"{"method":"svc.A","params":[{}],"id":5}"#).await;
        let req = codec.read_request().await.unwrap().unwrap();
        codec.write_response(req.seq, Ok(json!(null))).await.unwrap();

        let err = codec.write_response(req.seq, Ok(json!(null))).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid sequence number in response: 1");
    }

    #[tokio::test]
    async fn test_invalid_envelope_and_eof() {
        let (mut client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::new(server);

        send(&mut client, "").await;
        send(&mut client, "not json").await;
        let err = codec.read_request().await.unwrap_err();
        assert!(matches!(err, CodecError::Envelope(_)));

        drop(client);
        assert!(codec.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        let (mut client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::with_max_line(server, 64);

        send(&mut client, &"x".repeat(200)).await;
        let err = codec.read_request().await.unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong(64)));
        assert_eq!(err.to_string(), "request line exceeds 64 bytes");
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct HelloRequest {
        target: String,
    }

    #[test]
    fn test_decode_params() {
        let req: HelloRequest = decode_params(Some(json!([{"target": "bob"}]))).unwrap();
        assert_eq!(req.target, "bob");

        let err = decode_params::<HelloRequest>(None).unwrap_err();
        assert_eq!(err.to_string(), "jsonrpc: request body missing params");
        assert!(matches!(
            decode_params::<HelloRequest>(Some(Value::Null)),
            Err(CodecError::MissingParams)
        ));

        assert!(matches!(
            decode_params::<HelloRequest>(Some(json!([{"target": 1}]))),
            Err(CodecError::Body(_))
        ));
        assert!(matches!(
            decode_params::<HelloRequest>(Some(json!([]))),
            Err(CodecError::Body(_))
        ));
    }

    #[tokio::test]
    async fn test_state_transitions_gate_idle_close() {
        let (mut client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::new(server);
        assert_eq!(codec.state(), ConnState::New);

        // Fresh connections get a grace period.
        assert!(!codec.close_if_idle().unwrap());

        send(&mut client, r#"{"method":"svc.A","params":[{}],"id":1}"#).await;
        let req = codec.read_request().await.unwrap().unwrap();
        assert_eq!(codec.state(), ConnState::Active);
        assert!(!codec.close_if_idle().unwrap());

        codec.write_response(req.seq, Ok(json!(true))).await.unwrap();
        assert_eq!(codec.state(), ConnState::Idle);
        assert!(codec.close_if_idle().unwrap());
        assert_eq!(codec.state(), ConnState::Closed);

        // Closed is permanent and reads stop.
        assert!(codec.read_request().await.unwrap().is_none());
        assert_eq!(codec.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn test_stale_new_connection_is_idle() {
        let (_client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::new(server);

        codec.set_state_at(ConnState::New, now_unix() - 10);
        assert!(codec.close_if_idle().unwrap());
        assert!(codec.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (_client, server) = tokio::io::duplex(4096);
        let codec = ServerCodec::new(server);

        let reader = codec.clone();
        let read = tokio::spawn(async move { reader.read_request().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        codec.close().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .expect("reader should wake")
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tracked_codec_untracks_on_close() {
        let lifecycle = Arc::new(Lifecycle::new());
        let (_client, server) = tokio::io::duplex(4096);

        let codec = ServerCodec::tracked(server, &lifecycle).unwrap();
        assert_eq!(lifecycle.count(ResourceKind::Codec), 1);

        codec.close().unwrap();
        codec.close().unwrap();
        assert_eq!(lifecycle.count(ResourceKind::Codec), 0);

        lifecycle.begin_shutdown();
        let (_client, server) = tokio::io::duplex(4096);
        assert!(ServerCodec::tracked(server, &lifecycle).is_none());
        assert!(lifecycle.is_drained());
    }
}
