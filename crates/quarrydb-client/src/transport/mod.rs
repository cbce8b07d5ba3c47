//! The `Connection` contract (spec §6.2) and its two wire realizations.
//!
//! `Connection` is implemented by four distinct things that are all
//! interchangeable from a caller's point of view:
//!
//! - [`http::HttpTransport`] — single endpoint, request/response over HTTP.
//! - [`stream::StreamTransport`] — single endpoint, binary multiplexed
//!   stream.
//! - [`crate::auth::AuthenticatedConnection`] — decorates any `Connection`
//!   with credential injection.
//! - [`crate::cluster::ClusterConnection`] — wraps N single-endpoint
//!   `Connection`s behind one failover-aware façade.
//!
//! Each call is independently thread-safe: a `Connection` is always held
//! behind an `Arc` and every method takes `&self`.

pub mod http;
pub mod stream;

use async_trait::async_trait;

use crate::codec::ContentType;
use crate::context::RequestContext;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Build a new, empty request bound to this connection's path and
    /// method conventions. Does not perform I/O.
    fn new_request(&self, method: &str, path: &str) -> Result<Request> {
        Request::new(method, path)
    }

    /// Send `req` and return its response. `ctx` carries the deadline,
    /// cancellation token, and any endpoint pin.
    async fn do_request(&self, ctx: &RequestContext, req: Request) -> Result<Response>;

    /// The endpoint URLs this connection currently considers reachable.
    /// A single-endpoint transport returns exactly one; a cluster router
    /// returns the whole pool.
    fn endpoints(&self) -> Vec<String>;

    /// Replace the endpoint set wholesale (spec §4.9 endpoint auto-sync).
    /// A single-endpoint transport rejects this with `InvalidArgument`
    /// unless the new set is exactly its own endpoint.
    async fn update_endpoints(&self, endpoints: Vec<String>) -> Result<()>;

    /// The content type this connection negotiates requests/responses
    /// with.
    fn protocols(&self) -> ContentType;
}

/// Decode a previously-fetched raw JSON value with the connection's
/// negotiated codec, mirroring the `Unmarshal(rawObject, out)` operation
/// of spec §6.2. Exposed as a free function (not a trait method) because
/// trait objects cannot carry a generic method.
pub fn unmarshal<T: serde::de::DeserializeOwned>(protocol: ContentType, raw: &serde_json::Value) -> Result<T> {
    let _ = protocol;
    serde_json::from_value(raw.clone()).map_err(|e| error_stack::Report::new(crate::error::ClientError::Serialization(e)))
}
