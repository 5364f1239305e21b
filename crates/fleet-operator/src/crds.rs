//! CRD installation on startup using server-side apply

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use fleet_common::crd::FleetCluster;
use fleet_common::FIELD_MANAGER;

/// Name of the FleetCluster CRD object
pub const FLEET_CLUSTER_CRD: &str = "fleetclusters.fleet.dev";

/// Render the FleetCluster CRD as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&FleetCluster::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

/// Ensure the FleetCluster CRD is installed at the version this binary was built with
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing {} CRD...", FLEET_CLUSTER_CRD);
    crds.patch(
        FLEET_CLUSTER_CRD,
        &params,
        &Patch::Apply(&FleetCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", FLEET_CLUSTER_CRD, e))?;

    tracing::info!("FleetCluster CRD installed/updated");
    Ok(())
}
