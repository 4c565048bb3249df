use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fednet_route_operator::client::KubeTunnelEndpointClient;
use fednet_route_operator::controllers::{tunnelendpoint, ControllerContext};
use fednet_route_operator::events::KubeEventPublisher;
use fednet_route_operator::firewall::iptables::{IptablesOps, KernelIptables};
use fednet_route_operator::health::{run_health_server, HealthState};
use fednet_route_operator::netlink::{KernelNetLink, NetLinkOps};
use fednet_route_operator::shutdown::Teardown;
use fednet_route_operator::store::RuleStore;
use fednet_route_operator::RouteOperatorConfig;

const CONTROLLER_NAME: &str = "fednet-route-operator";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("fednet-route-operator starting");

    let config = RouteOperatorConfig::from_env().context("Invalid configuration")?;
    info!(
        node = %config.node_name,
        cluster_pod_cidr = %config.cluster_pod_cidr,
        gateway = config.role.is_gateway(),
        vxlan_iface = %config.vxlan_iface,
        retry_secs = config.retry_interval.as_secs(),
        "Loaded configuration"
    );
    let config = Arc::new(config);

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let iptables: Arc<dyn IptablesOps> =
        Arc::new(KernelIptables::new().context("Failed to initialize iptables")?);
    let netlink: Arc<dyn NetLinkOps> =
        Arc::new(KernelNetLink::new().context("Failed to open netlink socket")?);
    let store = Arc::new(RuleStore::new());

    let ctx = Arc::new(ControllerContext::new(
        config.clone(),
        Arc::new(KubeTunnelEndpointClient::new(kube_client.clone())),
        Arc::new(KubeEventPublisher::new(
            kube_client.clone(),
            CONTROLLER_NAME,
            &config.node_name,
        )),
        iptables.clone(),
        netlink.clone(),
        store.clone(),
    ));
    let teardown = Teardown::new(iptables.clone(), netlink, store, config.vxlan_iface.clone());

    let health_state = Arc::new(HealthState::new(iptables));
    let mut health = tokio::spawn(run_health_server(health_state, config.health_port));

    let shutdown = Arc::new(Notify::new());
    let stop = shutdown.clone();
    let mut controller = tokio::spawn(tunnelendpoint::run(kube_client, ctx, async move {
        stop.notified().await
    }));

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    select! {
        result = &mut controller => {
            // Controller failure should trigger pod restart
            return handle_controller_exit("TunnelEndpoint", result);
        }
        result = &mut health => {
            return handle_health_exit(result);
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    // Stop the watch before tearing down
    shutdown.notify_one();
    match timeout(config.shutdown_timeout, &mut controller).await {
        Ok(Ok(())) => info!("Controller stopped"),
        Ok(Err(e)) => warn!(error = %e, "Controller task ended abnormally"),
        Err(_) => {
            warn!(
                timeout_secs = config.shutdown_timeout.as_secs(),
                "Controller did not stop in time, aborting"
            );
            controller.abort();
        }
    }

    info!(
        timeout_secs = config.shutdown_timeout.as_secs(),
        "Tearing down kernel state"
    );
    match timeout(config.shutdown_timeout, teardown.run()).await {
        Ok(report) => info!(
            chains_flushed = report.chains_flushed,
            rules_dropped = report.rules_dropped,
            chain_refs_removed = report.chain_refs_removed,
            chains_removed = report.chains_removed,
            routes_removed = report.routes_removed,
            interface_removed = report.interface_removed,
            errors = report.errors,
            "Teardown complete"
        ),
        Err(_) => error!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Teardown timed out"
        ),
    }
    health.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Handle a controller task exit, returning an error to trigger pod restart
fn handle_controller_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => {
            error!(controller = name, "Controller exited unexpectedly");
            bail!("{} controller exited unexpectedly", name)
        }
        Err(e) if e.is_panic() => {
            error!(controller = name, "Controller panicked");
            bail!("{} controller panicked: {:?}", name, e.into_panic())
        }
        Err(e) if e.is_cancelled() => {
            warn!(controller = name, "Controller was cancelled");
            bail!("{} controller was cancelled", name)
        }
        Err(e) => {
            error!(controller = name, error = ?e, "Controller task failed");
            bail!("{} controller task failed: {}", name, e)
        }
    }
}

fn handle_health_exit(
    result: std::result::Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(Ok(())) => bail!("Health server exited unexpectedly"),
        Ok(Err(e)) => {
            error!(error = %e, "Health server failed");
            Err(e).context("Health server failed")
        }
        Err(e) => {
            error!(error = ?e, "Health server task failed");
            bail!("Health server task failed: {}", e)
        }
    }
}
