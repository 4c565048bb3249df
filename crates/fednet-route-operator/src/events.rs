//! Kubernetes Events attached to TunnelEndpoints
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `instance` is the node name, so `kubectl describe` shows which node's
    /// agent reported the event
    pub fn new(client: Client, controller_name: &str, instance: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: Some(instance.to_string()),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reason strings (REASON column of `kubectl get events`)
pub mod reasons {
    pub const CHAINS_READY: &str = "ChainsReady";
    pub const RULES_INSTALLED: &str = "RulesInstalled";
    pub const ROUTES_INSTALLED: &str = "RoutesInstalled";
    pub const CHAINS_FAILED: &str = "ChainsFailed";
    pub const RULES_FAILED: &str = "RulesFailed";
    pub const ROUTES_FAILED: &str = "RoutesFailed";
    pub const RULE_REMOVAL_FAILED: &str = "RuleRemovalFailed";
    pub const ROUTE_REMOVAL_FAILED: &str = "RouteRemovalFailed";
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
}

/// Event action strings
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const CLEANUP: &str = "Cleanup";
}
