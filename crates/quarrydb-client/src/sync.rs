//! Endpoint auto-sync background loop (spec §4.9 "C9: Endpoint sync").
//!
//! Periodically asks one of the cluster's current endpoints for its
//! server role and, when that role identifies a clustered coordinator,
//! replaces the router's pool with the freshly-discovered coordinator
//! set. A no-op on single-server deployments (role probe never reports
//! "coordinator"). Grounded on `ModelPool::start_idle_cleanup`
//! (`model_pool.rs`): spawn once at construction, loop on a
//! `tokio::time::interval`, swallow errors and retry next tick, hold an
//! `AbortHandle`-equivalent (here, a `JoinHandle` dropped on `Stop`) so
//! the background task dies with its owner.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cluster::ClusterConnection;
use crate::context::RequestContext;
use crate::transport::Connection;

/// What a role probe reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerRole {
    Single,
    Coordinator { coordinators: Vec<String> },
    DbServer,
    Agent,
}

#[async_trait::async_trait]
pub trait RoleProbe: Send + Sync {
    async fn probe(&self, conn: &dyn Connection) -> crate::error::Result<ServerRole>;
}

/// Background task handle. Dropping it aborts the loop.
pub struct EndpointSyncHandle {
    task: JoinHandle<()>,
}

impl Drop for EndpointSyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the auto-sync loop. `interval` of zero disables it (returns
/// `None`) per spec §4.9's "nop on unconfigured interval".
pub fn start(router: Arc<ClusterConnection>, probe: Arc<dyn RoleProbe>, interval: Duration) -> Option<EndpointSyncHandle> {
    if interval.is_zero() {
        return None;
    }

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = sync_once(&router, probe.as_ref()).await {
                warn!(error = ?err, "endpoint auto-sync tick failed, retrying next interval");
            }
        }
    });

    Some(EndpointSyncHandle { task })
}

async fn sync_once(router: &ClusterConnection, probe: &dyn RoleProbe) -> crate::error::Result<()> {
    let role = probe.probe(router).await?;
    match role {
        ServerRole::Coordinator { coordinators } if !coordinators.is_empty() => {
            debug!(count = coordinators.len(), "endpoint auto-sync replacing pool");
            router.update_endpoints(coordinators).await?;
        }
        _ => {}
    }
    Ok(())
}

/// Default `RoleProbe`: `GET /_admin/server/role`, expecting
/// `{"role": "COORDINATOR", "coordinators": [...] }` or `{"role": "SINGLE"}`
/// style bodies.
pub struct ServerRoleProbe;

#[async_trait::async_trait]
impl RoleProbe for ServerRoleProbe {
    async fn probe(&self, conn: &dyn Connection) -> crate::error::Result<ServerRole> {
        let req = conn.new_request("GET", "/_admin/server/role")?;
        let ctx = RequestContext::new();
        let resp = conn.do_request(&ctx, req).await?;
        resp.check_status(&[200])?;

        let role: String = resp.parse_body("role").unwrap_or_else(|_| "SINGLE".to_string());
        match role.as_str() {
            "COORDINATOR" => {
                let coordinators: Vec<String> = resp.parse_body("coordinators").unwrap_or_default();
                Ok(ServerRole::Coordinator { coordinators })
            }
            "PRIMARY" | "DBSERVER" => Ok(ServerRole::DbServer),
            "AGENT" => Ok(ServerRole::Agent),
            _ => Ok(ServerRole::Single),
        }
    }
}
