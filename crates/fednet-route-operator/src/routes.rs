//! Route installer
//!
//! On the gateway the remote pod range is routed straight into the tunnel
//! device. Every other node sends it over the overlay to the gateway.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::NodeRole;
use crate::netlink::{NetLinkError, NetLinkOps, Route};
use crate::store::RuleStore;
use crate::tunnelendpoint::{parse_cidr, TunnelEndpoint};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },
    #[error("tunnel interface for cluster {0} is not ready")]
    TunnelNotReady(String),
    #[error("failed to add route {route}: {source}")]
    Add {
        route: Route,
        #[source]
        source: NetLinkError,
    },
    #[error("failed to delete route {route}: {source}")]
    Delete {
        route: Route,
        #[source]
        source: NetLinkError,
    },
}

/// Delete a route; one that is already gone counts as deleted.
/// Returns false if there was nothing to delete.
pub(crate) async fn delete_route(
    netlink: &dyn NetLinkOps,
    route: &Route,
) -> Result<bool, RouteError> {
    match netlink.del_route(route).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(source) => Err(RouteError::Delete {
            route: route.clone(),
            source,
        }),
    }
}

pub struct RouteInstaller {
    netlink: Arc<dyn NetLinkOps>,
    store: Arc<RuleStore>,
    role: NodeRole,
    vxlan_iface: String,
}

impl RouteInstaller {
    pub fn new(
        netlink: Arc<dyn NetLinkOps>,
        store: Arc<RuleStore>,
        role: NodeRole,
        vxlan_iface: impl Into<String>,
    ) -> Self {
        Self {
            netlink,
            store,
            role,
            vxlan_iface: vxlan_iface.into(),
        }
    }

    pub fn desired_route(&self, endpoint: &TunnelEndpoint) -> Result<Route, RouteError> {
        let raw = endpoint.effective_remote_cidr();
        let destination = parse_cidr(raw).map_err(|e| RouteError::InvalidCidr {
            cidr: raw.to_string(),
            reason: e.to_string(),
        })?;

        match self.role {
            NodeRole::Gateway => {
                let tunnel = endpoint
                    .tunnel_iface()
                    .ok_or_else(|| RouteError::TunnelNotReady(endpoint.cluster_id().to_string()))?;
                Ok(Route {
                    destination,
                    gateway: None,
                    device: tunnel.to_string(),
                })
            }
            NodeRole::Member { vxlan_gateway } => Ok(Route {
                destination,
                gateway: Some(vxlan_gateway),
                device: self.vxlan_iface.clone(),
            }),
        }
    }

    /// Install the endpoint's route and drop any previously tracked route
    /// that no longer matches (remap or tunnel name changed).
    #[instrument(skip(self, endpoint), fields(cluster_id = %endpoint.cluster_id()))]
    pub async fn install_routes(&self, endpoint: &TunnelEndpoint) -> Result<(), RouteError> {
        let cluster_id = endpoint.cluster_id();
        let route = self.desired_route(endpoint)?;

        match self.netlink.add_route(&route).await {
            Ok(()) => info!(cluster_id = %cluster_id, route = %route, "Installed route"),
            Err(NetLinkError::Exists(_)) => {
                debug!(cluster_id = %cluster_id, route = %route, "Route already present")
            }
            Err(source) => {
                return Err(RouteError::Add {
                    route: route.clone(),
                    source,
                })
            }
        }
        self.store.track_route(cluster_id, route.clone()).await;

        let stale: Vec<Route> = self
            .store
            .routes(cluster_id)
            .await
            .into_iter()
            .filter(|r| *r != route)
            .collect();
        for old in &stale {
            if delete_route(self.netlink.as_ref(), old).await? {
                info!(cluster_id = %cluster_id, route = %old, "Removed stale route");
            }
        }
        self.store.set_routes(cluster_id, vec![route]).await;
        Ok(())
    }

    /// Delete every route tracked for the cluster.
    ///
    /// Already-absent routes count as removed. On the first other failure
    /// the routes not yet removed stay tracked and the error is returned.
    #[instrument(skip(self))]
    pub async fn remove_routes(&self, cluster_id: &str) -> Result<usize, RouteError> {
        let routes = self.store.routes(cluster_id).await;
        let mut removed = 0;

        for (i, route) in routes.iter().enumerate() {
            match delete_route(self.netlink.as_ref(), route).await {
                Ok(true) => {
                    removed += 1;
                    info!(cluster_id = %cluster_id, route = %route, "Removed route");
                }
                Ok(false) => debug!(cluster_id = %cluster_id, route = %route, "Route already absent"),
                Err(e) => {
                    warn!(
                        cluster_id = %cluster_id,
                        route = %route,
                        error = %e,
                        "Failed to remove route"
                    );
                    self.store.set_routes(cluster_id, routes[i..].to_vec()).await;
                    return Err(e);
                }
            }
        }

        self.store.set_routes(cluster_id, Vec::new()).await;
        Ok(removed)
    }

    /// Track the endpoint's computed route when none is tracked for its
    /// cluster. Returns whether a route was adopted.
    pub async fn adopt_route(&self, endpoint: &TunnelEndpoint) -> bool {
        let cluster_id = endpoint.cluster_id();
        if !self.store.routes(cluster_id).await.is_empty() {
            return false;
        }
        match self.desired_route(endpoint) {
            Ok(route) => {
                debug!(cluster_id = %cluster_id, route = %route, "Adopted untracked route");
                self.store.set_routes(cluster_id, vec![route]).await;
                true
            }
            Err(e) => {
                debug!(cluster_id = %cluster_id, error = %e, "No route to adopt");
                false
            }
        }
    }
}
