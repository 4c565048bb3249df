//! TunnelEndpoint CRD: one remote cluster's pod network and tunnel state
//!
//! Created by the federation handshake when two clusters agree to peer. The
//! tunnel provisioner fills in `status.tunnelIFaceName` once the encrypted
//! device exists. This operator only ever touches `metadata.finalizers`.

use ipnet::Ipv4Net;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Literal used by the handshake to mean "no remap negotiated"
pub const NO_REMAP: &str = "None";

/// TunnelEndpoint spec - written by the federation handshake
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "net.fednet.io",
    version = "v1alpha1",
    kind = "TunnelEndpoint",
    plural = "tunnelendpoints",
    shortname = "tep",
    namespaced = true,
    status = "TunnelEndpointStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterID"}"#,
    printcolumn = r#"{"name":"PodCIDR", "type":"string", "jsonPath":".spec.podCIDR"}"#,
    printcolumn = r#"{"name":"Tunnel", "type":"string", "jsonPath":".status.tunnelIFaceName"}"#
)]
pub struct TunnelEndpointSpec {
    /// Identifier of the remote cluster
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    /// Native pod CIDR of the remote cluster
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,
    /// Public address of the remote tunnel endpoint
    #[serde(rename = "endpointIP", default, skip_serializing_if = "Option::is_none")]
    pub endpoint_ip: Option<String>,
}

/// TunnelEndpoint status - written by the handshake and the tunnel provisioner
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct TunnelEndpointStatus {
    /// Substitute CIDR for the remote pods when their range collided locally
    #[serde(rename = "remoteRemappedPodCIDR", default, skip_serializing_if = "Option::is_none")]
    pub remote_remapped_pod_cidr: Option<String>,
    /// Substitute CIDR the remote cluster uses for our pods
    #[serde(rename = "localRemappedPodCIDR", default, skip_serializing_if = "Option::is_none")]
    pub local_remapped_pod_cidr: Option<String>,
    /// Name of the tunnel device; empty until the provisioner is done
    #[serde(rename = "tunnelIFaceName", default, skip_serializing_if = "Option::is_none")]
    pub tunnel_iface_name: Option<String>,
}

/// Returns the remap value only if one was actually negotiated.
fn remap(value: Option<&String>) -> Option<&str> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty() && *s != NO_REMAP)
}

/// Parse a CIDR string into its canonical network form
pub fn parse_cidr(value: &str) -> Result<Ipv4Net, ipnet::AddrParseError> {
    value.trim().parse::<Ipv4Net>().map(|net| net.trunc())
}

impl TunnelEndpoint {
    pub fn cluster_id(&self) -> &str {
        &self.spec.cluster_id
    }

    /// Tunnel device name, `None` while the tunnel is not ready
    pub fn tunnel_iface(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.tunnel_iface_name.as_deref())
            .filter(|name| !name.is_empty())
    }

    pub fn remote_remap(&self) -> Option<&str> {
        remap(self.status.as_ref().and_then(|s| s.remote_remapped_pod_cidr.as_ref()))
    }

    pub fn local_remap(&self) -> Option<&str> {
        remap(self.status.as_ref().and_then(|s| s.local_remapped_pod_cidr.as_ref()))
    }

    /// Remote pod range as seen from this cluster.
    ///
    /// The remapped range wins when the remote side was remapped.
    pub fn effective_remote_cidr(&self) -> &str {
        self.remote_remap().unwrap_or(self.spec.pod_cidr.as_str())
    }

    /// Our own pod range as seen by the remote cluster.
    pub fn effective_local_cidr<'a>(&'a self, cluster_pod_cidr: &'a str) -> &'a str {
        self.local_remap().unwrap_or(cluster_pod_cidr)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|name| name == finalizer))
            .unwrap_or(false)
    }

    /// Add the finalizer; returns false if it was already present
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        true
    }

    /// Remove the finalizer; returns false if it was not present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|name| name != finalizer);
        before != finalizers.len()
    }
}
