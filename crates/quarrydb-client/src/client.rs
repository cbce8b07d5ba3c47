//! Top-level wiring: turn a [`ClientConfig`] into a working
//! [`Connection`] tree (transport → authenticator → cluster router) plus
//! its background endpoint-sync loop.
//!
//! Grounded on `mofa-gateway`'s service bootstrap (`Gateway::new` builds
//! its backend pool and wraps it with the configured middleware before
//! handing back one handle) — here the "backend pool" is the cluster
//! router and the "middleware" is the authenticator decorator.

use std::sync::Arc;
use std::time::Duration;

use crate::agency::AgencyRacer;
use crate::auth::{AuthMethod, AuthenticatedConnection};
use crate::cluster::ClusterConnection;
use crate::config::{AuthenticationMode, ClientConfig};
use crate::error::Result;
use crate::sync::{EndpointSyncHandle, ServerRoleProbe};
use crate::transport::Connection;
use crate::transport::http::{HttpTransport, HttpTransportConfig};

/// Owns the connection tree built from a [`ClientConfig`] and the
/// endpoint auto-sync task, if one was started. Dropping it stops the
/// sync task; the connection itself stays alive for as long as a caller
/// holds a clone of the `Arc` returned by [`Client::connection`].
pub struct Client {
    connection: Arc<dyn Connection>,
    _sync_handle: Option<EndpointSyncHandle>,
    agency_timeout_floor: Duration,
}

impl Client {
    /// Build every connection in `config.endpoints`, wrap each with the
    /// configured authentication, fold them behind a [`ClusterConnection`],
    /// and start the auto-sync loop if `config.sync_interval_secs` is
    /// nonzero (spec §4.9).
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let content_type = config.content_type.into();
        let connect_timeout = config.connect_timeout();
        let http2 = config.http2;
        let auth_method = auth_method_for(&config.authentication.0);

        let build_one = {
            let content_type = content_type;
            let auth_method = auth_method.clone();
            move |endpoint: &str| -> Result<Arc<dyn Connection>> {
                let transport_config =
                    HttpTransportConfig { content_type, connect_timeout, http2, ..HttpTransportConfig::new(endpoint) };
                let transport = Arc::new(HttpTransport::new(transport_config)?) as Arc<dyn Connection>;
                Ok(match &auth_method {
                    Some(method) => AuthenticatedConnection::wrap(transport, method.clone()),
                    None => transport,
                })
            }
        };

        let initial: Vec<Arc<dyn Connection>> =
            config.endpoints.iter().map(|e| build_one(e)).collect::<Result<_>>()?;

        let factory = {
            let build_one = build_one.clone();
            Arc::new(move |endpoint: &str| build_one(endpoint))
        };
        let router = ClusterConnection::new(initial, factory)?;
        router.set_default_deadline(config.default_deadline());

        let sync_handle = crate::sync::start(router.clone(), Arc::new(ServerRoleProbe), config.sync_interval());

        Ok(Self { connection: router, _sync_handle: sync_handle, agency_timeout_floor: config.agency_timeout_floor() })
    }

    /// The connection handle callers issue requests through. Already a
    /// failover router over every configured endpoint, already
    /// authenticated.
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.connection.clone()
    }

    /// Build an [`AgencyRacer`] over `peers`, carrying this client's
    /// configured `agency_timeout_floor_secs` (spec §4.5).
    pub fn agency_racer(&self, peers: Vec<Arc<dyn Connection>>) -> Result<AgencyRacer> {
        Ok(AgencyRacer::new(peers)?.with_timeout_floor(self.agency_timeout_floor))
    }
}

fn auth_method_for(mode: &AuthenticationMode) -> Option<AuthMethod> {
    match mode {
        AuthenticationMode::None => None,
        AuthenticationMode::Basic { username, password } => {
            Some(AuthMethod::Static { header: "authorization".into(), value: crate::auth::static_basic_header(username, password) })
        }
        AuthenticationMode::Jwt { username, password } => Some(AuthMethod::Jwt {
            username: username.clone(),
            password: password.clone(),
            handshake_path: "/_open/auth".into(),
        }),
    }
}
