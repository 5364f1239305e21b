//! Controller runner - builds the access controller futures
//!
//! Each `build_*` function returns a Vec of boxed futures that the caller
//! drives concurrently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use fleet_access::{bootstrap, direct, error_policy, overlay_controller, status, Context};
use fleet_common::crd::FleetCluster;
use fleet_common::CREDENTIAL_LABEL_SELECTOR;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn credential_watcher() -> WatcherConfig {
    watcher().labels(CREDENTIAL_LABEL_SELECTOR)
}

/// Build the bootstrap controller over labeled credential Secrets
pub fn build_bootstrap_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let secrets: Api<Secret> = Api::all(client);

    tracing::info!("- Credential bootstrap controller");

    vec![Box::pin(
        Controller::new(secrets, credential_watcher())
            .shutdown_on_signal()
            .run(bootstrap::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Bootstrap")),
    )]
}

/// Build the mode controllers (direct always, overlay when configured)
///
/// Both own the credential Secret so edits to it trigger a pass.
pub fn build_access_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let clusters: Api<FleetCluster> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    tracing::info!("- Direct access controller");
    let mut controllers: Vec<ControllerFuture> = vec![Box::pin(
        Controller::new(clusters.clone(), watcher())
            .owns(secrets.clone(), credential_watcher())
            .shutdown_on_signal()
            .run(direct::reconcile, error_policy, ctx.clone())
            .for_each(log_reconcile_result("Direct")),
    )];

    if ctx.overlay.is_some() {
        tracing::info!("- Overlay access controller");
        controllers.push(Box::pin(
            Controller::new(clusters, watcher())
                .owns(secrets, credential_watcher())
                .shutdown_on_signal()
                .run(overlay_controller::reconcile, error_policy, ctx)
                .for_each(log_reconcile_result("Overlay")),
        ));
    } else {
        tracing::info!("No overlay control API configured, overlay controller disabled");
    }

    controllers
}

/// Build the status aggregator
pub fn build_status_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let clusters: Api<FleetCluster> = Api::all(client);

    tracing::info!("- Status controller");

    vec![Box::pin(
        Controller::new(clusters, watcher())
            .shutdown_on_signal()
            .run(status::reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Status")),
    )]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
