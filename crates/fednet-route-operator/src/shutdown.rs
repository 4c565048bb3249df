//! Node teardown at process exit
//!
//! Removes everything this agent put into the kernel: custom chains and their
//! jump rules, every tracked route, and the overlay interface. Runs once,
//! after the controller has stopped. Nothing here is fatal; each failure is
//! logged, counted and skipped.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::firewall::delete_rule;
use crate::firewall::iptables::IptablesOps;
use crate::netlink::NetLinkOps;
use crate::routes::delete_route;
use crate::store::RuleStore;

/// Outcome of a teardown run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub chains_flushed: usize,
    /// Per-cluster rules dropped from bookkeeping (flushed with their chains)
    pub rules_dropped: usize,
    pub chain_refs_removed: usize,
    pub chains_removed: usize,
    pub routes_removed: usize,
    pub interface_removed: bool,
    pub errors: usize,
}

pub struct Teardown {
    iptables: Arc<dyn IptablesOps>,
    netlink: Arc<dyn NetLinkOps>,
    store: Arc<RuleStore>,
    vxlan_iface: String,
}

impl Teardown {
    pub fn new(
        iptables: Arc<dyn IptablesOps>,
        netlink: Arc<dyn NetLinkOps>,
        store: Arc<RuleStore>,
        vxlan_iface: impl Into<String>,
    ) -> Self {
        Self {
            iptables,
            netlink,
            store,
            vxlan_iface: vxlan_iface.into(),
        }
    }

    /// Best-effort removal of all kernel state tracked in the store.
    ///
    /// Order: flush chains, drop rule bookkeeping, delete jump rules, delete
    /// chains, delete routes, delete the overlay interface.
    #[instrument(skip(self), fields(vxlan_iface = %self.vxlan_iface))]
    pub async fn run(&self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for chain in self.store.chains().await {
            match self.iptables.flush_chain(&chain.table, &chain.name).await {
                Ok(()) => {
                    report.chains_flushed += 1;
                    info!(chain = %chain, "Flushed iptables chain");
                }
                Err(e) if e.is_not_exist() => {
                    debug!(chain = %chain, "Chain already absent");
                    self.store.untrack_chain(&chain).await;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(chain = %chain, error = %e, "Failed to flush iptables chain");
                }
            }
        }

        report.rules_dropped = self.store.rule_count().await;
        self.store.clear_rules().await;

        for rule in self.store.chain_refs().await {
            match delete_rule(self.iptables.as_ref(), &rule).await {
                Ok(removed) => {
                    if removed {
                        report.chain_refs_removed += 1;
                        info!(rule = %rule, "Removed chain reference rule");
                    }
                    self.store.untrack_chain_ref(&rule).await;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(rule = %rule, error = %e, "Failed to remove chain reference rule");
                }
            }
        }

        for chain in self.store.chains().await {
            match self.iptables.delete_chain(&chain.table, &chain.name).await {
                Ok(()) => {
                    report.chains_removed += 1;
                    info!(chain = %chain, "Deleted iptables chain");
                    self.store.untrack_chain(&chain).await;
                }
                Err(e) if e.is_not_exist() => {
                    self.store.untrack_chain(&chain).await;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(chain = %chain, error = %e, "Failed to delete iptables chain");
                }
            }
        }

        for cluster_id in self.store.route_clusters().await {
            let mut remaining = Vec::new();
            for route in self.store.routes(&cluster_id).await {
                match delete_route(self.netlink.as_ref(), &route).await {
                    Ok(removed) => {
                        if removed {
                            report.routes_removed += 1;
                            info!(cluster_id = %cluster_id, route = %route, "Removed route");
                        }
                    }
                    Err(e) => {
                        report.errors += 1;
                        error!(cluster_id = %cluster_id, error = %e, "Failed to remove route");
                        remaining.push(route);
                    }
                }
            }
            self.store.set_routes(&cluster_id, remaining).await;
        }

        match self.netlink.link_index(&self.vxlan_iface).await {
            Ok(index) => match self.netlink.del_link(index).await {
                Ok(()) => {
                    report.interface_removed = true;
                    info!(iface = %self.vxlan_iface, index, "Removed overlay interface");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(iface = %self.vxlan_iface, error = %e, "Failed to remove overlay interface");
                }
            },
            Err(e) => {
                warn!(iface = %self.vxlan_iface, error = %e, "Overlay interface not found, skipping");
            }
        }

        report
    }
}
