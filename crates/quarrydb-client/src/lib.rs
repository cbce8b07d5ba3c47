//! Transport and request-orchestration core for a multi-model database
//! client: connection abstraction over HTTP and binary stream wire
//! transports, cluster failover routing, agency racing, authentication,
//! the cursor engine, and the context-settings layer that decodes a
//! typed options bag onto the wire.
//!
//! This crate has no typed `Database`/`Collection` surface — it is the
//! layer those would be built on (connect, send, retry, stream cursor
//! results) and stops exactly there.
//!
//! ```no_run
//! # async fn run() -> error_stack::Result<(), quarrydb_client::ClientError> {
//! use quarrydb_client::{Client, ClientConfig, RequestContext, Request};
//!
//! let client = Client::connect(ClientConfig::new(["http://localhost:8629"]))?;
//! let conn = client.connection();
//! let req = conn.new_request("GET", "/_api/version")?;
//! let resp = conn.do_request(&RequestContext::new(), req).await?;
//! resp.check_status(&[200])?;
//! # Ok(())
//! # }
//! ```

pub mod agency;
pub mod async_job;
pub mod auth;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod context;
pub mod cursor;
pub mod error;
pub mod options;
pub mod query;
pub mod request;
pub mod response;
pub mod sync;
pub mod transport;

pub use agency::{AgencyRacer, RaceMode};
pub use async_job::{job_from_response, AsyncJob, JobStatus};
pub use auth::{AuthMethod, AuthenticatedConnection};
pub use client::Client;
pub use cluster::ClusterConnection;
pub use codec::ContentType;
pub use config::{AuthenticationMode, ClientConfig, WireContentType};
pub use context::RequestContext;
pub use cursor::{Cursor, CursorStats};
pub use error::{ClientError, ErrorClassifiers, Result};
pub use options::{AsyncMode, RequestOptions, ResponseEffects};
pub use query::QueryOptions;
pub use request::{Body, Method, Request};
pub use response::Response;
pub use sync::{EndpointSyncHandle, RoleProbe, ServerRole, ServerRoleProbe};
pub use transport::{unmarshal, Connection};
