//! Node-static configuration
//!
//! Everything here is fixed for the lifetime of the agent and comes from the
//! DaemonSet's environment.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use ipnet::Ipv4Net;
use tracing::warn;

use crate::tunnelendpoint::parse_cidr;

/// Finalizer prefix; the node name is appended so each node's agent blocks
/// deletion until its own kernel state is clean
pub const FINALIZER_PREFIX: &str = "route-operator.net.fednet.io";

pub const DEFAULT_VXLAN_IFACE: &str = "fednet.vxlan";
pub const DEFAULT_VXLAN_PORT: u16 = 4789;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Role of this node in the cluster's federation data path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Terminates the tunnels and NATs traffic for the whole cluster
    Gateway,
    /// Reaches remote clusters through the gateway over the overlay
    Member { vxlan_gateway: Ipv4Addr },
}

impl NodeRole {
    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::Gateway)
    }
}

#[derive(Debug, Clone)]
pub struct RouteOperatorConfig {
    pub node_name: String,
    /// This cluster's own pod range
    pub cluster_pod_cidr: Ipv4Net,
    pub role: NodeRole,
    pub vxlan_iface: String,
    pub vxlan_port: u16,
    /// Fixed delay between reconciles of a healthy descriptor, and between
    /// retries of a failed one
    pub retry_interval: Duration,
    pub shutdown_timeout: Duration,
    pub health_port: u16,
    /// Watch a single namespace instead of the whole cluster
    pub watch_namespace: Option<String>,
}

impl RouteOperatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NODE_NAME`: this node's name (required)
    /// - `CLUSTER_POD_CIDR`: this cluster's pod CIDR (required)
    /// - `IS_GATEWAY`: "true" on the gateway node (default: false)
    /// - `GATEWAY_VXLAN_IP`: gateway's overlay address (required unless gateway)
    /// - `VXLAN_IFACE_NAME`: overlay interface (default: fednet.vxlan)
    /// - `VXLAN_PORT`: overlay UDP port (default: 4789)
    /// - `RETRY_INTERVAL_SECS`: reconcile interval in seconds (default: 30)
    /// - `SHUTDOWN_TIMEOUT_SECS`: teardown budget in seconds (default: 20)
    /// - `HEALTH_PORT`: probe server port (default: 8081)
    /// - `WATCH_NAMESPACE`: restrict the watch to one namespace (optional)
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var("NODE_NAME").context("NODE_NAME must be set")?;
        ensure!(!node_name.trim().is_empty(), "NODE_NAME cannot be empty");

        let raw_cidr =
            std::env::var("CLUSTER_POD_CIDR").context("CLUSTER_POD_CIDR must be set")?;
        let cluster_pod_cidr = parse_cidr(&raw_cidr)
            .with_context(|| format!("CLUSTER_POD_CIDR {raw_cidr:?} is not an IPv4 CIDR"))?;

        let is_gateway = std::env::var("IS_GATEWAY")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);
        let role = if is_gateway {
            NodeRole::Gateway
        } else {
            let raw = std::env::var("GATEWAY_VXLAN_IP")
                .context("GATEWAY_VXLAN_IP required on non-gateway nodes")?;
            let vxlan_gateway = raw
                .trim()
                .parse::<Ipv4Addr>()
                .with_context(|| format!("GATEWAY_VXLAN_IP {raw:?} is not an IPv4 address"))?;
            NodeRole::Member { vxlan_gateway }
        };

        let vxlan_iface = std::env::var("VXLAN_IFACE_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VXLAN_IFACE.to_string());

        let vxlan_port = parse_port_env("VXLAN_PORT", DEFAULT_VXLAN_PORT)?;
        let health_port = parse_port_env("HEALTH_PORT", DEFAULT_HEALTH_PORT)?;

        let retry_interval = parse_duration_env("RETRY_INTERVAL_SECS", DEFAULT_RETRY_INTERVAL);
        ensure!(
            !retry_interval.is_zero(),
            "RETRY_INTERVAL_SECS must be greater than zero"
        );
        let shutdown_timeout =
            parse_duration_env("SHUTDOWN_TIMEOUT_SECS", DEFAULT_SHUTDOWN_TIMEOUT);

        let watch_namespace = std::env::var("WATCH_NAMESPACE")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            node_name,
            cluster_pod_cidr,
            role,
            vxlan_iface,
            vxlan_port,
            retry_interval,
            shutdown_timeout,
            health_port,
            watch_namespace,
        })
    }

    /// Finalizer owned by this node's agent
    pub fn finalizer(&self) -> String {
        format!("{}/{}", FINALIZER_PREFIX, self.node_name)
    }
}

/// Parse a duration from an environment variable with logging on failure.
fn parse_duration_env(var_name: &str, default: Duration) -> Duration {
    match std::env::var(var_name) {
        Ok(v) => match v.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                warn!(
                    env_var = var_name,
                    value = %v,
                    error = %e,
                    default_secs = default.as_secs(),
                    "Failed to parse duration env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_port_env(var_name: &str, default: u16) -> Result<u16> {
    match std::env::var(var_name) {
        Ok(v) => {
            let port = v
                .trim()
                .parse::<u16>()
                .with_context(|| format!("{var_name} {v:?} is not a valid port"))?;
            ensure!(port != 0, "{var_name} cannot be zero");
            Ok(port)
        }
        Err(_) => Ok(default),
    }
}
