//! TunnelEndpoint controller
//!
//! Watches net.fednet.io/v1alpha1 TunnelEndpoint resources and converges this
//! node's iptables rules and routes for each remote cluster.
//!
//! ## Lifecycle
//!
//! `AwaitingTunnel -> Active -> Deleting -> Gone`. A descriptor waits until
//! the tunnel provisioner has named its device. The node's finalizer is then
//! attached before any kernel state is written, and removed only once every
//! tracked rule and route for the cluster is gone. Healthy descriptors are
//! requeued on a fixed interval so out-of-band kernel changes are repaired.

use std::sync::Arc;

use futures::{Future, StreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client as KubeClient, Resource};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::client::ClientError;
use crate::events::{actions, reasons};
use crate::firewall::FirewallError;
use crate::routes::RouteError;
use crate::tunnelendpoint::TunnelEndpoint;

use super::retry::{retry_action, ErrorKind};
use super::ControllerContext;

#[derive(Debug, Error)]
pub enum TunnelEndpointError {
    #[error("firewall error: {0}")]
    Firewall(#[from] FirewallError),
    #[error("route error: {0}")]
    Route(#[from] RouteError),
    #[error("TunnelEndpoint client error: {0}")]
    Client(#[from] ClientError),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

async fn publish(
    ctx: &ControllerContext,
    obj_ref: &ObjectReference,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(obj_ref, type_, reason, action, Some(note))
        .await;
}

/// Reconcile a single TunnelEndpoint
#[instrument(
    skip(ctx, tep),
    fields(
        name = %tep.metadata.name.as_deref().unwrap_or("unknown"),
        namespace = %tep.metadata.namespace.as_deref().unwrap_or("unknown")
    )
)]
pub async fn reconcile(
    tep: Arc<TunnelEndpoint>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, TunnelEndpointError> {
    let name = tep
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| TunnelEndpointError::MissingField("metadata.name".to_string()))?;
    let namespace = tep
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| TunnelEndpointError::MissingField("metadata.namespace".to_string()))?;
    let key = format!("{namespace}/{name}");

    // The watch cache can lag behind our own finalizer writes
    let Some(current) = ctx.client.get(namespace, name).await? else {
        debug!(key = %key, "TunnelEndpoint no longer exists");
        ctx.retry_tracker.reset(&key);
        return Ok(Action::await_change());
    };

    let interval = ctx.config.retry_interval;
    if current.tunnel_iface().is_none() {
        info!(
            key = %key,
            cluster_id = %current.cluster_id(),
            retry_secs = interval.as_secs(),
            "Tunnel interface not ready yet"
        );
        return Ok(Action::requeue(interval));
    }

    if current.is_deleting() {
        cleanup(current, &key, &ctx).await
    } else {
        apply(current, &key, &ctx).await
    }
}

/// Active path: finalizer, chains, rules, routes
async fn apply(
    mut tep: TunnelEndpoint,
    key: &str,
    ctx: &ControllerContext,
) -> Result<Action, TunnelEndpointError> {
    let cluster_id = tep.cluster_id().to_string();
    let finalizer = ctx.config.finalizer();

    if tep.add_finalizer(&finalizer) {
        match ctx.client.replace(&tep).await {
            Ok(updated) => {
                info!(key = %key, finalizer = %finalizer, "Added finalizer");
                tep = updated;
            }
            Err(ClientError::Conflict(_)) => {
                debug!(key = %key, "Finalizer update conflicted, newer version pending");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let obj_ref = tep.object_ref(&());

    if let Err(e) = ctx.chains.ensure_chains().await {
        publish(
            ctx,
            &obj_ref,
            EventType::Warning,
            reasons::CHAINS_FAILED,
            actions::RECONCILE,
            format!("unable to set up iptables chains: {e}"),
        )
        .await;
        return Err(e.into());
    }
    publish(
        ctx,
        &obj_ref,
        EventType::Normal,
        reasons::CHAINS_READY,
        actions::RECONCILE,
        "iptables chains in place".to_string(),
    )
    .await;

    if let Err(e) = ctx.rules.install_rules(&tep).await {
        publish(
            ctx,
            &obj_ref,
            EventType::Warning,
            reasons::RULES_FAILED,
            actions::RECONCILE,
            format!("unable to install iptables rules for cluster {cluster_id}: {e}"),
        )
        .await;
        return Err(e.into());
    }
    publish(
        ctx,
        &obj_ref,
        EventType::Normal,
        reasons::RULES_INSTALLED,
        actions::RECONCILE,
        format!("iptables rules installed for cluster {cluster_id}"),
    )
    .await;

    if let Err(e) = ctx.routes.install_routes(&tep).await {
        publish(
            ctx,
            &obj_ref,
            EventType::Warning,
            reasons::ROUTES_FAILED,
            actions::RECONCILE,
            format!("unable to install routes for cluster {cluster_id}: {e}"),
        )
        .await;
        return Err(e.into());
    }
    publish(
        ctx,
        &obj_ref,
        EventType::Normal,
        reasons::ROUTES_INSTALLED,
        actions::RECONCILE,
        format!("route installed for cluster {cluster_id}"),
    )
    .await;

    ctx.retry_tracker.reset(key);
    debug!(key = %key, cluster_id = %cluster_id, "TunnelEndpoint converged");
    Ok(Action::requeue(ctx.config.retry_interval))
}

/// Deletion path: rules, routes, then release the finalizer
async fn cleanup(
    mut tep: TunnelEndpoint,
    key: &str,
    ctx: &ControllerContext,
) -> Result<Action, TunnelEndpointError> {
    let interval = ctx.config.retry_interval;
    let finalizer = ctx.config.finalizer();
    if !tep.has_finalizer(&finalizer) {
        debug!(key = %key, "Deleting without our finalizer, nothing to clean up");
        return Ok(Action::requeue(interval));
    }

    let cluster_id = tep.cluster_id().to_string();
    let obj_ref = tep.object_ref(&());

    // state installed before a restart is not tracked yet
    ctx.rules.adopt_rules(&tep).await;
    ctx.routes.adopt_route(&tep).await;

    if let Err(e) = ctx.rules.remove_rules(&cluster_id).await {
        publish(
            ctx,
            &obj_ref,
            EventType::Warning,
            reasons::RULE_REMOVAL_FAILED,
            actions::CLEANUP,
            format!("unable to remove iptables rules for cluster {cluster_id}: {e}"),
        )
        .await;
        return Err(e.into());
    }

    if let Err(e) = ctx.routes.remove_routes(&cluster_id).await {
        publish(
            ctx,
            &obj_ref,
            EventType::Warning,
            reasons::ROUTE_REMOVAL_FAILED,
            actions::CLEANUP,
            format!("unable to remove routes for cluster {cluster_id}: {e}"),
        )
        .await;
        return Err(e.into());
    }

    tep.remove_finalizer(&finalizer);
    match ctx.client.replace(&tep).await {
        Ok(_) => {
            info!(key = %key, cluster_id = %cluster_id, "Cleanup complete, finalizer removed");
            publish(
                ctx,
                &obj_ref,
                EventType::Normal,
                reasons::CLEANUP_COMPLETE,
                actions::CLEANUP,
                format!("iptables rules and routes for cluster {cluster_id} removed"),
            )
            .await;
        }
        Err(ClientError::Conflict(_)) | Err(ClientError::NotFound(_)) => {
            debug!(key = %key, "Finalizer removal superseded by a concurrent update");
        }
        Err(e) => return Err(e.into()),
    }

    ctx.retry_tracker.reset(key);
    Ok(Action::requeue(interval))
}

/// Classify error type for retry behavior
fn classify_error(error: &TunnelEndpointError) -> ErrorKind {
    match error {
        TunnelEndpointError::Firewall(FirewallError::InvalidCidr { .. }) => ErrorKind::Permanent,
        TunnelEndpointError::Firewall(_) => ErrorKind::Transient,
        TunnelEndpointError::Route(RouteError::InvalidCidr { .. }) => ErrorKind::Permanent,
        TunnelEndpointError::Route(_) => ErrorKind::Transient,
        TunnelEndpointError::Client(ClientError::MissingField(_)) => ErrorKind::Permanent,
        TunnelEndpointError::Client(_) => ErrorKind::Transient,
        TunnelEndpointError::MissingField(_) => ErrorKind::Permanent,
    }
}

/// Error policy for the controller
fn error_policy(
    tep: Arc<TunnelEndpoint>,
    error: &TunnelEndpointError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = format!(
        "{}/{}",
        tep.metadata.namespace.as_deref().unwrap_or("unknown"),
        tep.metadata.name.as_deref().unwrap_or("unknown")
    );
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&key);

    warn!(
        key = %key,
        cluster_id = %tep.cluster_id(),
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "TunnelEndpoint reconciliation failed"
    );

    retry_action(attempt, kind, ctx.config.retry_interval)
}

/// Run the TunnelEndpoint controller until `shutdown` resolves.
///
/// In-flight reconciles are allowed to finish before this returns.
pub async fn run<F>(client: KubeClient, ctx: Arc<ControllerContext>, shutdown: F)
where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let api: Api<TunnelEndpoint> = match ctx.config.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    info!(
        namespace = ?ctx.config.watch_namespace,
        node = %ctx.config.node_name,
        gateway = ctx.config.role.is_gateway(),
        "Starting TunnelEndpoint controller"
    );

    Controller::new(api, WatcherConfig::default())
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "TunnelEndpoint reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "TunnelEndpoint controller error");
                }
            }
        })
        .await;

    info!("TunnelEndpoint controller stopped");
}
