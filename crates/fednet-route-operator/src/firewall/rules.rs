//! Per-cluster rule installer
//!
//! Computes the NAT exemption, forward/input allow rules and (on the gateway)
//! the SNAT and NETMAP rules for one remote cluster, installs them, and keeps
//! the cluster's rule set in [`RuleStore`] in step with what is in the kernel.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tracing::{debug, info, instrument, warn};

use super::iptables::IptablesOps;
use super::{
    append_unique, delete_rule, insert_unique, FirewallError, IptablesRule, FILTER_TABLE,
    FORWARD_CHAIN, INPUT_CHAIN, NAT_TABLE, POSTROUTING_CHAIN, PREROUTING_CHAIN,
};
use crate::store::RuleStore;
use crate::tunnelendpoint::{parse_cidr, TunnelEndpoint};

/// Where a rule goes in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Append,
    /// First position, ahead of the NAT exemption
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRule {
    pub rule: IptablesRule,
    pub placement: Placement,
}

impl DesiredRule {
    fn append(rule: IptablesRule) -> Self {
        Self {
            rule,
            placement: Placement::Append,
        }
    }

    fn head(rule: IptablesRule) -> Self {
        Self {
            rule,
            placement: Placement::Head,
        }
    }
}

fn cidr(value: &str) -> Result<Ipv4Net, FirewallError> {
    parse_cidr(value).map_err(|e| FirewallError::InvalidCidr {
        cidr: value.to_string(),
        reason: e.to_string(),
    })
}

/// First usable host address of a network
pub fn first_usable(net: &Ipv4Net) -> Option<Ipv4Addr> {
    net.hosts().next()
}

pub struct RuleInstaller {
    iptables: Arc<dyn IptablesOps>,
    store: Arc<RuleStore>,
    cluster_pod_cidr: Ipv4Net,
    is_gateway: bool,
}

impl RuleInstaller {
    pub fn new(
        iptables: Arc<dyn IptablesOps>,
        store: Arc<RuleStore>,
        cluster_pod_cidr: Ipv4Net,
        is_gateway: bool,
    ) -> Self {
        Self {
            iptables,
            store,
            cluster_pod_cidr,
            is_gateway,
        }
    }

    /// Rules this node needs for the endpoint, in installation order
    pub fn desired_rules(&self, endpoint: &TunnelEndpoint) -> Result<Vec<DesiredRule>, FirewallError> {
        let remote = cidr(endpoint.effective_remote_cidr())?.to_string();
        let local_remap = endpoint.local_remap().map(cidr).transpose()?;
        let local_net = local_remap.unwrap_or(self.cluster_pod_cidr);
        let local = local_net.to_string();

        let mut rules = vec![
            // no masquerade between the two pod ranges
            DesiredRule::append(IptablesRule::new(
                NAT_TABLE,
                POSTROUTING_CHAIN,
                ["-s", local.as_str(), "-d", remote.as_str(), "-j", "ACCEPT"],
            )),
            DesiredRule::append(IptablesRule::new(
                FILTER_TABLE,
                FORWARD_CHAIN,
                ["-d", remote.as_str(), "-j", "ACCEPT"],
            )),
            DesiredRule::append(IptablesRule::new(
                FILTER_TABLE,
                INPUT_CHAIN,
                ["-s", local.as_str(), "-d", remote.as_str(), "-j", "ACCEPT"],
            )),
        ];

        if !self.is_gateway {
            return Ok(rules);
        }

        let Some(tunnel) = endpoint.tunnel_iface() else {
            return Err(FirewallError::TunnelNotReady(endpoint.cluster_id().to_string()));
        };
        let snat_ip = first_usable(&local_net)
            .ok_or_else(|| FirewallError::InvalidCidr {
                cidr: local.clone(),
                reason: "no usable host address".to_string(),
            })?
            .to_string();
        rules.push(DesiredRule::append(IptablesRule::new(
            NAT_TABLE,
            POSTROUTING_CHAIN,
            ["-o", tunnel, "-j", "SNAT", "--to", snat_ip.as_str()],
        )));

        if let Some(remap) = local_remap {
            let remap = remap.to_string();
            let cluster = self.cluster_pod_cidr.to_string();
            rules.push(DesiredRule::head(IptablesRule::new(
                NAT_TABLE,
                POSTROUTING_CHAIN,
                [
                    "-s",
                    cluster.as_str(),
                    "-d",
                    remote.as_str(),
                    "-j",
                    "NETMAP",
                    "--to",
                    remap.as_str(),
                ],
            )));
            rules.push(DesiredRule::append(IptablesRule::new(
                NAT_TABLE,
                PREROUTING_CHAIN,
                [
                    "-d",
                    remap.as_str(),
                    "-i",
                    tunnel,
                    "-j",
                    "NETMAP",
                    "--to",
                    cluster.as_str(),
                ],
            )));
        }

        Ok(rules)
    }

    /// Install the endpoint's rules.
    ///
    /// Each rule is tracked as soon as it is in the kernel, so a failure part
    /// way leaves everything installed so far tracked for cleanup. Once all
    /// rules are in, tracked rules that are no longer wanted are deleted.
    #[instrument(skip(self, endpoint), fields(cluster_id = %endpoint.cluster_id()))]
    pub async fn install_rules(&self, endpoint: &TunnelEndpoint) -> Result<(), FirewallError> {
        let cluster_id = endpoint.cluster_id();
        let desired = self.desired_rules(endpoint)?;

        for wanted in &desired {
            let added = match wanted.placement {
                Placement::Append => append_unique(self.iptables.as_ref(), &wanted.rule).await?,
                Placement::Head => insert_unique(self.iptables.as_ref(), &wanted.rule, 1).await?,
            };
            if added {
                info!(cluster_id = %cluster_id, rule = %wanted.rule, "Installed iptables rule");
            }
            self.store.track_rule(cluster_id, wanted.rule.clone()).await;
        }

        let wanted: Vec<IptablesRule> = desired.into_iter().map(|d| d.rule).collect();
        let stale: Vec<IptablesRule> = self
            .store
            .rules(cluster_id)
            .await
            .into_iter()
            .filter(|rule| !wanted.contains(rule))
            .collect();
        for rule in &stale {
            if delete_rule(self.iptables.as_ref(), rule).await? {
                info!(cluster_id = %cluster_id, rule = %rule, "Removed stale iptables rule");
            }
        }
        self.store.set_rules(cluster_id, wanted).await;
        Ok(())
    }

    /// Delete every rule tracked for the cluster, in the order recorded.
    ///
    /// Already-absent rules count as removed. On the first other failure the
    /// rules not yet removed stay tracked and the error is returned.
    #[instrument(skip(self))]
    pub async fn remove_rules(&self, cluster_id: &str) -> Result<(), FirewallError> {
        let rules = self.store.rules(cluster_id).await;
        if rules.is_empty() {
            debug!(cluster_id = %cluster_id, "No tracked iptables rules");
            return Ok(());
        }

        for (i, rule) in rules.iter().enumerate() {
            match delete_rule(self.iptables.as_ref(), rule).await {
                Ok(true) => info!(cluster_id = %cluster_id, rule = %rule, "Removed iptables rule"),
                Ok(false) => debug!(cluster_id = %cluster_id, rule = %rule, "Rule already absent"),
                Err(e) => {
                    warn!(
                        cluster_id = %cluster_id,
                        rule = %rule,
                        remaining = rules.len() - i,
                        error = %e,
                        "Failed to remove iptables rule"
                    );
                    self.store.set_rules(cluster_id, rules[i..].to_vec()).await;
                    return Err(e);
                }
            }
        }

        self.store.set_rules(cluster_id, Vec::new()).await;
        Ok(())
    }

    /// Track the endpoint's computed rules when nothing is tracked for its
    /// cluster, so a later [`remove_rules`](Self::remove_rules) reaches rules
    /// installed before a restart. Returns the number of rules adopted.
    pub async fn adopt_rules(&self, endpoint: &TunnelEndpoint) -> usize {
        let cluster_id = endpoint.cluster_id();
        if !self.store.rules(cluster_id).await.is_empty() {
            return 0;
        }
        match self.desired_rules(endpoint) {
            Ok(desired) => {
                let rules: Vec<IptablesRule> = desired.into_iter().map(|d| d.rule).collect();
                let adopted = rules.len();
                debug!(cluster_id = %cluster_id, adopted, "Adopted untracked iptables rules");
                self.store.set_rules(cluster_id, rules).await;
                adopted
            }
            Err(e) => {
                debug!(cluster_id = %cluster_id, error = %e, "No rules to adopt");
                0
            }
        }
    }
}
