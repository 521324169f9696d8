use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

mod args;
mod db;
mod error;
mod gate;
mod handlers;
mod lifecycle;
mod maintenance;
mod models;
mod orchestrator;
mod server;
mod tenant;

use args::ServerArgs;
use orchestrator::CliOrchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    store_control_common::init();
    tracing_subscriber::fmt().json().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = ServerArgs::parse();

    let pool = store_control_common::postgres::create_pool(args.postgres.clone()).await;
    db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let orchestrator: Arc<dyn orchestrator::Orchestrator> =
        Arc::new(CliOrchestrator::new("helm", "kubectl", kube_client));

    let args = Arc::new(args);

    tokio::spawn(maintenance::run(pool.clone(), (*args).clone()));

    store_control_common::signal_ready();

    server::run(pool, orchestrator, args, store_control_common::shutdown::shutdown_signal()).await
}
