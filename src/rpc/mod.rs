//! RPC plumbing shared by providers and consumers.
//!
//! ## Architecture
//!
//! - `protocol`: request/response envelopes
//! - `codec`: server-side codec that re-keys request ids into sequence numbers
//! - `transport`: TCP accept loop and the client-side dialer seam
//! - `methods`: provider method table and dispatcher
//! - `client`: pooled client for one provider instance

pub mod client;
pub mod codec;
pub mod methods;
pub mod protocol;
pub mod transport;

pub use client::{ClientError, RpcClient};
pub use codec::{CodecError, ConnState, ServerCodec, ServerRequest};
pub use methods::{MethodRegistry, MethodSet};
pub use protocol::{Request, Response};
pub use transport::{Connection, Dialer, TcpDialer};
