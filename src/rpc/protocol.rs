//! Wire envelope types.
//!
//! Requests and responses follow the JSON-RPC 1.0 shape: a request is
//! `{"method", "params", "id"}` where `params` is a one-element array, and a
//! response is `{"id", "result", "error"}` with `error` carried as a plain
//! string. Exactly one of `result`/`error` is present on a response. Each
//! envelope is one JSON document terminated by a newline.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest envelope line accepted from a peer, newline included.
pub const MAX_LINE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {0} bytes")]
    TooLong(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// `"Provider.Method"`
    pub method: String,
    /// A one-element array holding the call's argument.
    #[serde(default)]
    pub params: Option<Value>,
    /// Caller-chosen correlation id. Any JSON value, echoed back verbatim.
    #[serde(default)]
    pub id: Option<Value>,
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    /// Result on success (mutually exclusive with error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message on failure (mutually exclusive with result)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Request {
    /// Build a request that passes `param` as the single argument.
    pub fn call(method: impl Into<String>, param: Value, id: Value) -> Self {
        Self {
            method: method.into(),
            params: Some(Value::Array(vec![param])),
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// Append one newline-terminated line to `line`, reading at most `max`
/// bytes. Returns the number of bytes read; 0 means end of stream.
pub async fn read_line_limited<R>(reader: &mut R, line: &mut String, max: usize) -> Result<usize, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(max as u64).read_line(line).await?;
    if read == max && !line.ends_with('\n') {
        return Err(FrameError::TooLong(max));
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_line_limited() {
        let mut reader = BufReader::new(&b"{\"id\":1}\n{\"id\":2}"[..]);
        let mut line = String::new();

        assert_eq!(read_line_limited(&mut reader, &mut line, 16).await.unwrap(), 9);
        assert_eq!(line, "{\"id\":1}\n");

        // A final line without a newline is still returned.
        line.clear();
        assert_eq!(read_line_limited(&mut reader, &mut line, 16).await.unwrap(), 8);
        line.clear();
        assert_eq!(read_line_limited(&mut reader, &mut line, 16).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_line_limited_rejects_overlong_line() {
        let mut reader = BufReader::new(&b"0123456789abcdef\n"[..]);
        let mut line = String::new();

        let err = read_line_limited(&mut reader, &mut line, 8).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLong(8)));

        // Exactly at the limit, newline included, is fine.
        let mut reader = BufReader::new(&b"0123456\n"[..]);
        line.clear();
        assert_eq!(read_line_limited(&mut reader, &mut line, 8).await.unwrap(), 8);
    }

    #[test]
    fn test_parse_request() {
        let json = r#"{"method":"sample-hello-service.Hello","params":[{"target":"bob"}],"id":7}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "sample-hello-service.Hello");
        assert_eq!(req.params, Some(json!([{"target": "bob"}])));
        assert_eq!(req.id, Some(Value::Number(7.into())));
    }

    #[test]
    fn test_parse_request_without_id() {
        let json = r#"{"method":"svc.Ping","params":[{}]}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert!(req.id.is_none());

        // An explicit null id reads the same way.
        let json = r#"{"method":"svc.Ping","params":[{}],"id":null}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert!(req.id.is_none());
    }

    #[test]
    fn test_serialize_success_response() {
        let resp = Response::success(json!("abc"), json!({"result": "Hello bob"}));
        let value = serde_json::to_value(&resp).unwrap();

        assert_eq!(
            value,
            json!({"id": "abc", "result": {"result": "Hello bob"}})
        );
    }

    #[test]
    fn test_serialize_error_response() {
        let resp = Response::error(json!(3), "rpc: can't find method svc.Nope");
        let value = serde_json::to_value(&resp).unwrap();

        assert_eq!(
            value,
            json!({"id": 3, "error": "rpc: can't find method svc.Nope"})
        );
    }

    #[test]
    fn test_parse_response_with_null_error() {
        let json = r#"{"id":1,"result":{"result":"ok"},"error":null}"#;
        let resp: Response = serde_json::from_str(json).unwrap();

        assert!(resp.error.is_none());
        assert_eq!(resp.result, Some(json!({"result": "ok"})));
    }

    #[test]
    fn test_call_wraps_param_in_array() {
        let req = Request::call("svc.Hello", json!({"target": "x"}), json!(1));
        let line = serde_json::to_string(&req).unwrap();

        assert!(line.contains(r#""params":[{"target":"x"}]"#));
        assert!(!line.contains('\n'));
    }
}
