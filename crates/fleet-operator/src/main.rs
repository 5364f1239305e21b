//! Fleet Operator - cluster access lifecycle for member clusters

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_access::Context;
use fleet_common::Metrics;
use fleet_operator::controller_runner::{
    build_access_controllers, build_bootstrap_controllers, build_status_controllers,
};
use fleet_operator::crds::{crd_yaml, ensure_crds_installed};
use fleet_operator::settings::AccessArgs;

/// Fleet - onboards member clusters and keeps their access healthy
#[derive(Parser, Debug)]
#[command(name = "fleet-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    access: AccessArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    run_controller(cli.access).await
}

async fn run_controller(args: AccessArgs) -> anyhow::Result<()> {
    let config = args
        .access_config()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    let overlay = args
        .overlay_api()
        .map_err(|e| anyhow::anyhow!("invalid overlay configuration: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let metrics = Metrics::new(&opentelemetry::global::meter("fleet-operator"));
    let mut builder = Context::builder(client.clone())
        .config(config)
        .metrics(metrics);
    if let Some(overlay) = overlay {
        builder = builder.overlay(overlay);
    }
    let ctx = Arc::new(builder.build());

    tracing::info!("Starting Fleet controllers:");
    let mut controllers = build_bootstrap_controllers(client.clone(), ctx.clone());
    controllers.extend(build_access_controllers(client.clone(), ctx.clone()));
    controllers.extend(build_status_controllers(client, ctx));

    futures::future::join_all(controllers).await;

    tracing::info!("Fleet controller shutting down");
    Ok(())
}
