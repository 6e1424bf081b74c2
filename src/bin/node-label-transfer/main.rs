// System
use std::sync::Arc;

// Third Party
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Local
use node_label_transfer::{
    cache::ClusterCache,
    config::{Args, Config},
    controller::Controller,
    reconciler::KubeLabelPatcher,
    utils::{init_tracing, setup_exit_hooks},
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::try_from(Args::parse())?;
    init_tracing("node_label_transfer", config.log_level.into());

    let shutdown = CancellationToken::new();
    setup_exit_hooks(shutdown.clone())?;

    let client = Client::try_default().await?;
    if config.transfer.is_empty() {
        warn!("No --label given, pods will not receive any labels");
    }
    info!(
        "Transferring node labels {:?} to pods every {:?}",
        config.transfer.keys(),
        config.controller.interval
    );

    let cache = Arc::new(ClusterCache::new(&client));
    let patcher = Arc::new(KubeLabelPatcher::new(&client));
    let controller = Controller::new(cache, patcher, config.transfer, config.controller);
    controller.run(shutdown).await;

    info!("Stopped");
    Ok(())
}
