//! TunnelEndpoint controller and its shared state

pub mod retry;
pub mod tunnelendpoint;

use std::sync::Arc;

use crate::client::TunnelEndpointClientTrait;
use crate::config::RouteOperatorConfig;
use crate::events::EventPublisher;
use crate::firewall::chains::ChainManager;
use crate::firewall::iptables::IptablesOps;
use crate::firewall::rules::RuleInstaller;
use crate::netlink::NetLinkOps;
use crate::routes::RouteInstaller;
use crate::store::RuleStore;

use self::retry::RetryTracker;

/// Shared state for the controller
pub struct ControllerContext {
    /// Live reads and finalizer writes
    pub client: Arc<dyn TunnelEndpointClientTrait>,
    pub events: Arc<dyn EventPublisher>,
    pub chains: ChainManager,
    pub rules: RuleInstaller,
    pub routes: RouteInstaller,
    /// Node configuration
    pub config: Arc<RouteOperatorConfig>,
    pub retry_tracker: Arc<RetryTracker>,
}

impl ControllerContext {
    /// Wire the installers to the kernel seams; they share one [`RuleStore`]
    pub fn new(
        config: Arc<RouteOperatorConfig>,
        client: Arc<dyn TunnelEndpointClientTrait>,
        events: Arc<dyn EventPublisher>,
        iptables: Arc<dyn IptablesOps>,
        netlink: Arc<dyn NetLinkOps>,
        store: Arc<RuleStore>,
    ) -> Self {
        Self {
            client,
            events,
            chains: ChainManager::new(iptables.clone(), store.clone(), config.vxlan_port),
            rules: RuleInstaller::new(
                iptables,
                store.clone(),
                config.cluster_pod_cidr,
                config.role.is_gateway(),
            ),
            routes: RouteInstaller::new(netlink, store, config.role, config.vxlan_iface.clone()),
            config,
            retry_tracker: Arc::new(RetryTracker::new()),
        }
    }
}
