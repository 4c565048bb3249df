//! fednet-route-operator: per-node agent converging iptables rules and routes
//! for federated remote clusters

pub mod client;
pub mod config;
pub mod controllers;
pub mod events;
pub mod firewall;
pub mod health;
pub mod netlink;
pub mod routes;
pub mod shutdown;
pub mod store;
pub mod tunnelendpoint;

#[cfg(test)]
pub(crate) mod testing;

pub use config::RouteOperatorConfig;
pub use tunnelendpoint::TunnelEndpoint;
