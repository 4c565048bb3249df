//! Kernel routing and link seam
//!
//! [`NetLinkOps`] is the narrow async interface the route installer and the
//! shutdown handler use. [`KernelNetLink`] talks rtnetlink over one
//! persistent connection.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

/// One IPv4 route in the main table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub destination: Ipv4Net,
    /// Next hop; `None` for routes straight out of a point-to-point device
    pub gateway: Option<Ipv4Addr>,
    pub device: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(f, "{} via {} dev {}", self.destination, gw, self.device),
            None => write!(f, "{} dev {}", self.destination, self.device),
        }
    }
}

#[derive(Debug, Error)]
pub enum NetLinkError {
    #[error("route {0} already exists")]
    Exists(String),
    #[error("route {0} not found")]
    NotFound(String),
    #[error("link {0} not found")]
    DeviceNotFound(String),
    #[error("netlink error: {0}")]
    Netlink(String),
}

impl NetLinkError {
    /// True when the object targeted by a delete is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::DeviceNotFound(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetLinkOps: Send + Sync {
    /// Kernel index of the named link
    async fn link_index(&self, name: &str) -> Result<u32, NetLinkError>;

    async fn add_route(&self, route: &Route) -> Result<(), NetLinkError>;

    async fn del_route(&self, route: &Route) -> Result<(), NetLinkError>;

    /// Delete a link by kernel index
    async fn del_link(&self, index: u32) -> Result<(), NetLinkError>;
}

/// Production [`NetLinkOps`] over a persistent rtnetlink connection
pub struct KernelNetLink {
    handle: rtnetlink::Handle,
    _conn_task: JoinHandle<()>,
}

impl KernelNetLink {
    /// Open the netlink socket; must be called inside a tokio runtime
    pub fn new() -> Result<Self, NetLinkError> {
        let (conn, handle, _) =
            rtnetlink::new_connection().map_err(|e| NetLinkError::Netlink(e.to_string()))?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => Some(msg.raw_code()),
        _ => None,
    }
}

fn destination_of(msg: &RouteMessage) -> Option<Ipv4Net> {
    let prefix_len = msg.header.destination_prefix_length;
    msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
            Ipv4Net::new(*addr, prefix_len).ok()
        }
        _ => None,
    })
}

fn oif_of(msg: &RouteMessage) -> Option<u32> {
    msg.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Oif(idx) => Some(*idx),
        _ => None,
    })
}

#[async_trait]
impl NetLinkOps for KernelNetLink {
    async fn link_index(&self, name: &str) -> Result<u32, NetLinkError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetLinkError::DeviceNotFound(name.to_string())),
            Err(e) if errno(&e) == Some(-libc::ENODEV) => {
                Err(NetLinkError::DeviceNotFound(name.to_string()))
            }
            Err(e) => Err(NetLinkError::Netlink(e.to_string())),
        }
    }

    async fn add_route(&self, route: &Route) -> Result<(), NetLinkError> {
        let index = self.link_index(&route.device).await?;
        let request = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.destination.addr(), route.destination.prefix_len())
            .output_interface(index);
        let request = match route.gateway {
            Some(gw) => request.gateway(gw),
            None => request,
        };
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(e) if errno(&e) == Some(-libc::EEXIST) => {
                Err(NetLinkError::Exists(route.to_string()))
            }
            Err(e) => Err(NetLinkError::Netlink(e.to_string())),
        }
    }

    async fn del_route(&self, route: &Route) -> Result<(), NetLinkError> {
        // Missing device means the kernel already dropped its routes
        let index = match self.link_index(&route.device).await {
            Ok(index) => index,
            Err(NetLinkError::DeviceNotFound(_)) => {
                return Err(NetLinkError::NotFound(route.to_string()))
            }
            Err(e) => return Err(e),
        };

        let mut routes = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();
        while let Some(msg) = routes
            .try_next()
            .await
            .map_err(|e| NetLinkError::Netlink(e.to_string()))?
        {
            if destination_of(&msg) != Some(route.destination) || oif_of(&msg) != Some(index) {
                continue;
            }
            debug!(route = %route, "Found kernel route to delete");
            return match self.handle.route().del(msg).execute().await {
                Ok(()) => Ok(()),
                Err(e) if errno(&e) == Some(-libc::ESRCH) => {
                    Err(NetLinkError::NotFound(route.to_string()))
                }
                Err(e) => Err(NetLinkError::Netlink(e.to_string())),
            };
        }
        Err(NetLinkError::NotFound(route.to_string()))
    }

    async fn del_link(&self, index: u32) -> Result<(), NetLinkError> {
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if errno(&e) == Some(-libc::ENODEV) => {
                Err(NetLinkError::DeviceNotFound(format!("index {index}")))
            }
            Err(e) => Err(NetLinkError::Netlink(e.to_string())),
        }
    }
}
