//! In-memory bookkeeping of kernel state installed by this process
//!
//! A cache of desired effect, not a source of truth: after a restart it is
//! rebuilt by idempotent re-installation. Per-cluster entries are keyed by
//! cluster ID; the work queue guarantees one in-flight reconcile per
//! descriptor, so only the maps themselves need locking.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::firewall::{IptablesChain, IptablesRule};
use crate::netlink::Route;

#[derive(Debug, Default)]
pub struct RuleStore {
    chains: RwLock<Vec<IptablesChain>>,
    chain_refs: RwLock<Vec<IptablesRule>>,
    cluster_rules: RwLock<HashMap<String, Vec<IptablesRule>>>,
    cluster_routes: RwLock<HashMap<String, Vec<Route>>>,
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) -> bool {
    if items.contains(&item) {
        return false;
    }
    items.push(item);
    true
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track_chain(&self, chain: IptablesChain) {
        push_unique(&mut *self.chains.write().await, chain);
    }

    pub async fn untrack_chain(&self, chain: &IptablesChain) {
        self.chains.write().await.retain(|c| c != chain);
    }

    pub async fn chains(&self) -> Vec<IptablesChain> {
        self.chains.read().await.clone()
    }

    pub async fn track_chain_ref(&self, rule: IptablesRule) {
        push_unique(&mut *self.chain_refs.write().await, rule);
    }

    pub async fn untrack_chain_ref(&self, rule: &IptablesRule) {
        self.chain_refs.write().await.retain(|r| r != rule);
    }

    pub async fn chain_refs(&self) -> Vec<IptablesRule> {
        self.chain_refs.read().await.clone()
    }

    /// Add a rule to a cluster's set unless already tracked
    pub async fn track_rule(&self, cluster_id: &str, rule: IptablesRule) {
        let mut rules = self.cluster_rules.write().await;
        push_unique(rules.entry(cluster_id.to_string()).or_default(), rule);
    }

    pub async fn rules(&self, cluster_id: &str) -> Vec<IptablesRule> {
        self.cluster_rules
            .read()
            .await
            .get(cluster_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a cluster's rule set; an empty set drops the entry
    pub async fn set_rules(&self, cluster_id: &str, rules: Vec<IptablesRule>) {
        let mut map = self.cluster_rules.write().await;
        if rules.is_empty() {
            map.remove(cluster_id);
        } else {
            map.insert(cluster_id.to_string(), rules);
        }
    }

    /// Drop every per-cluster rule set
    pub async fn clear_rules(&self) {
        self.cluster_rules.write().await.clear();
    }

    pub async fn track_route(&self, cluster_id: &str, route: Route) {
        let mut routes = self.cluster_routes.write().await;
        push_unique(routes.entry(cluster_id.to_string()).or_default(), route);
    }

    pub async fn routes(&self, cluster_id: &str) -> Vec<Route> {
        self.cluster_routes
            .read()
            .await
            .get(cluster_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace a cluster's route set; an empty set drops the entry
    pub async fn set_routes(&self, cluster_id: &str, routes: Vec<Route>) {
        let mut map = self.cluster_routes.write().await;
        if routes.is_empty() {
            map.remove(cluster_id);
        } else {
            map.insert(cluster_id.to_string(), routes);
        }
    }

    /// Cluster IDs with at least one tracked route
    pub async fn route_clusters(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cluster_routes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn rule_count(&self) -> usize {
        self.cluster_rules.read().await.values().map(Vec::len).sum()
    }

    pub async fn route_count(&self) -> usize {
        self.cluster_routes.read().await.values().map(Vec::len).sum()
    }
}
