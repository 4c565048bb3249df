//! Stateful in-memory fakes of the kernel and API seams

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;

use crate::client::{ClientError, TunnelEndpointClientTrait};
use crate::events::EventPublisher;
use crate::firewall::iptables::{IptablesError, IptablesOps};
use crate::firewall::CUSTOM_CHAINS;
use crate::netlink::{NetLinkError, NetLinkOps, Route};
use crate::tunnelendpoint::{TunnelEndpoint, TunnelEndpointSpec, TunnelEndpointStatus};

const MISSING_CHAIN: &str = "iptables: No chain/target/match by that name.";
const MISSING_RULE: &str = "iptables: Bad rule (does a matching rule exist in that chain?).";

/// Builds a descriptor in namespace `fednet` named `tep-<cluster>`
pub fn endpoint(
    cluster_id: &str,
    pod_cidr: &str,
    remote_remap: Option<&str>,
    local_remap: Option<&str>,
    tunnel: Option<&str>,
) -> TunnelEndpoint {
    TunnelEndpoint {
        metadata: ObjectMeta {
            name: Some(format!("tep-{cluster_id}")),
            namespace: Some("fednet".to_string()),
            uid: Some(format!("uid-{cluster_id}")),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: TunnelEndpointSpec {
            cluster_id: cluster_id.to_string(),
            pod_cidr: pod_cidr.to_string(),
            endpoint_ip: None,
        },
        status: Some(TunnelEndpointStatus {
            remote_remapped_pod_cidr: remote_remap.map(String::from),
            local_remapped_pod_cidr: local_remap.map(String::from),
            tunnel_iface_name: tunnel.map(String::from),
        }),
    }
}

#[derive(Default)]
struct IptablesState {
    /// (table, chain) -> rule specs in order
    chains: BTreeMap<(String, String), Vec<String>>,
    /// (operation, needle) pairs that fail with a command error
    failures: Vec<(String, String)>,
}

/// iptables with the built-in chains of the nat and filter tables
pub struct FakeIptables {
    state: Mutex<IptablesState>,
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIptables {
    pub fn new() -> Self {
        let mut state = IptablesState::default();
        for (table, chain) in [
            ("nat", "PREROUTING"),
            ("nat", "INPUT"),
            ("nat", "OUTPUT"),
            ("nat", "POSTROUTING"),
            ("filter", "INPUT"),
            ("filter", "FORWARD"),
            ("filter", "OUTPUT"),
        ] {
            state
                .chains
                .insert((table.to_string(), chain.to_string()), Vec::new());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Built-in chains plus the (empty, unreferenced) custom chains
    pub fn with_custom_chains() -> Self {
        let fake = Self::new();
        {
            let mut state = fake.state.lock().unwrap();
            for custom in CUSTOM_CHAINS {
                state
                    .chains
                    .insert((custom.table.to_string(), custom.name.to_string()), Vec::new());
            }
        }
        fake
    }

    /// Make every `operation` call whose chain or rule contains `needle` fail
    pub fn fail_on(&self, operation: &str, needle: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((operation.to_string(), needle.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn seed_rule(&self, table: &str, chain: &str, rule: &str) {
        self.state
            .lock()
            .unwrap()
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(rule.to_string());
    }

    pub fn flush(&self, table: &str, chain: &str) {
        if let Some(rules) = self
            .state
            .lock()
            .unwrap()
            .chains
            .get_mut(&(table.to_string(), chain.to_string()))
        {
            rules.clear();
        }
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .chains
            .contains_key(&(table.to_string(), chain.to_string()))
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_count(&self) -> usize {
        self.state.lock().unwrap().chains.values().map(Vec::len).sum()
    }

    /// Number of chains that are not built-in
    pub fn custom_chain_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .chains
            .keys()
            .filter(|(_, chain)| chain.starts_with("FEDNET-"))
            .count()
    }

    pub fn snapshot(&self) -> BTreeMap<(String, String), Vec<String>> {
        self.state.lock().unwrap().chains.clone()
    }

    fn check_failure(
        state: &IptablesState,
        operation: &str,
        chain: &str,
        rule: &str,
    ) -> Result<(), IptablesError> {
        let injected = state
            .failures
            .iter()
            .any(|(op, needle)| op == operation && (chain.contains(needle) || rule.contains(needle)));
        if injected {
            return Err(IptablesError::Command(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

fn key(table: &str, chain: &str) -> (String, String) {
    (table.to_string(), chain.to_string())
}

#[async_trait]
impl IptablesOps for FakeIptables {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, "chain_exists", chain, "")?;
        Ok(state.chains.contains_key(&key(table, chain)))
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "new_chain", chain, "")?;
        if state.chains.contains_key(&key(table, chain)) {
            return Err(IptablesError::Command(
                "iptables: Chain already exists.".to_string(),
            ));
        }
        state.chains.insert(key(table, chain), Vec::new());
        Ok(())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "flush_chain", chain, "")?;
        match state.chains.get_mut(&key(table, chain)) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(IptablesError::from_message(MISSING_CHAIN)),
        }
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "delete_chain", chain, "")?;
        let Some(rules) = state.chains.get(&key(table, chain)) else {
            return Err(IptablesError::from_message(MISSING_CHAIN));
        };
        if !rules.is_empty() {
            return Err(IptablesError::Command(
                "iptables: Directory not empty.".to_string(),
            ));
        }
        let jump = format!("-j {chain}");
        let referenced = state
            .chains
            .iter()
            .filter(|((t, _), _)| t == table)
            .any(|(_, rules)| rules.iter().any(|r| r.ends_with(&jump)));
        if referenced {
            return Err(IptablesError::Command("iptables: Too many links.".to_string()));
        }
        state.chains.remove(&key(table, chain));
        Ok(())
    }

    async fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, IptablesError> {
        let state = self.state.lock().unwrap();
        Self::check_failure(&state, "exists", chain, rule)?;
        match state.chains.get(&key(table, chain)) {
            Some(rules) => Ok(rules.iter().any(|r| r == rule)),
            None => Err(IptablesError::from_message(MISSING_CHAIN)),
        }
    }

    async fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "append", chain, rule)?;
        match state.chains.get_mut(&key(table, chain)) {
            Some(rules) => {
                rules.push(rule.to_string());
                Ok(())
            }
            None => Err(IptablesError::from_message(MISSING_CHAIN)),
        }
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), IptablesError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "insert", chain, rule)?;
        match state.chains.get_mut(&key(table, chain)) {
            Some(rules) => {
                let index = usize::try_from(position - 1).unwrap_or(0).min(rules.len());
                rules.insert(index, rule.to_string());
                Ok(())
            }
            None => Err(IptablesError::from_message(MISSING_CHAIN)),
        }
    }

    async fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), IptablesError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, "delete", chain, rule)?;
        let Some(rules) = state.chains.get_mut(&key(table, chain)) else {
            return Err(IptablesError::from_message(MISSING_CHAIN));
        };
        match rules.iter().position(|r| r == rule) {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(IptablesError::from_message(MISSING_RULE)),
        }
    }
}

#[derive(Default)]
struct NetLinkState {
    links: HashMap<String, u32>,
    routes: Vec<Route>,
    fail_delete: bool,
}

/// Routing table and link list
#[derive(Default)]
pub struct FakeNetLink {
    state: Mutex<NetLinkState>,
}

impl FakeNetLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, name: &str, index: u32) {
        self.state
            .lock()
            .unwrap()
            .links
            .insert(name.to_string(), index);
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(name)
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn clear_routes(&self) {
        self.state.lock().unwrap().routes.clear();
    }

    /// Make route deletion fail with a netlink error
    pub fn fail_delete(&self, fail: bool) {
        self.state.lock().unwrap().fail_delete = fail;
    }
}

#[async_trait]
impl NetLinkOps for FakeNetLink {
    async fn link_index(&self, name: &str) -> Result<u32, NetLinkError> {
        self.state
            .lock()
            .unwrap()
            .links
            .get(name)
            .copied()
            .ok_or_else(|| NetLinkError::DeviceNotFound(name.to_string()))
    }

    async fn add_route(&self, route: &Route) -> Result<(), NetLinkError> {
        let mut state = self.state.lock().unwrap();
        if !state.links.contains_key(&route.device) {
            return Err(NetLinkError::DeviceNotFound(route.device.clone()));
        }
        if state.routes.iter().any(|r| r.destination == route.destination) {
            return Err(NetLinkError::Exists(route.to_string()));
        }
        state.routes.push(route.clone());
        Ok(())
    }

    async fn del_route(&self, route: &Route) -> Result<(), NetLinkError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete {
            return Err(NetLinkError::Netlink("injected delete failure".to_string()));
        }
        match state.routes.iter().position(|r| r == route) {
            Some(index) => {
                state.routes.remove(index);
                Ok(())
            }
            None => Err(NetLinkError::NotFound(route.to_string())),
        }
    }

    async fn del_link(&self, index: u32) -> Result<(), NetLinkError> {
        let mut state = self.state.lock().unwrap();
        let Some(name) = state
            .links
            .iter()
            .find(|(_, i)| **i == index)
            .map(|(name, _)| name.clone())
        else {
            return Err(NetLinkError::DeviceNotFound(format!("index {index}")));
        };
        state.links.remove(&name);
        // the kernel drops routes through a deleted device
        state.routes.retain(|r| r.device != name);
        Ok(())
    }
}

#[derive(Default)]
struct ClientState {
    objects: HashMap<(String, String), TunnelEndpoint>,
    conflict_next_replace: bool,
    replaces: usize,
}

/// Descriptor store with resourceVersion checking
#[derive(Default)]
pub struct FakeTunnelEndpointClient {
    state: Mutex<ClientState>,
}

impl FakeTunnelEndpointClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, endpoint: TunnelEndpoint) {
        let key = object_key(&endpoint);
        self.state.lock().unwrap().objects.insert(key, endpoint);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<TunnelEndpoint> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Fail the next replace with a conflict, as if another writer won
    pub fn conflict_next_replace(&self) {
        self.state.lock().unwrap().conflict_next_replace = true;
    }

    pub fn replace_count(&self) -> usize {
        self.state.lock().unwrap().replaces
    }
}

fn object_key(endpoint: &TunnelEndpoint) -> (String, String) {
    (
        endpoint.metadata.namespace.clone().unwrap_or_default(),
        endpoint.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl TunnelEndpointClientTrait for FakeTunnelEndpointClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<TunnelEndpoint>, ClientError> {
        Ok(self.stored(namespace, name))
    }

    async fn replace(&self, endpoint: &TunnelEndpoint) -> Result<TunnelEndpoint, ClientError> {
        let mut state = self.state.lock().unwrap();
        if state.conflict_next_replace {
            state.conflict_next_replace = false;
            return Err(ClientError::Conflict(object_key(endpoint).1));
        }
        let key = object_key(endpoint);
        let Some(current) = state.objects.get(&key) else {
            return Err(ClientError::NotFound(key.1));
        };
        if current.metadata.resource_version != endpoint.metadata.resource_version {
            return Err(ClientError::Conflict(key.1));
        }
        let version: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut updated = endpoint.clone();
        updated.metadata.resource_version = Some((version + 1).to_string());
        let deleting = updated.metadata.deletion_timestamp.is_some();
        let unfinalized = updated
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.is_empty())
            .unwrap_or(true);
        state.replaces += 1;
        // the API server drops a terminating object once its last finalizer goes
        if deleting && unfinalized {
            state.objects.remove(&key);
        } else {
            state.objects.insert(key, updated.clone());
        }
        Ok(updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub object: Option<String>,
}

/// Keeps every published event
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.warning).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            object: resource_ref.name.clone(),
        });
    }
}
