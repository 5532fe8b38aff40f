//! certdht-node: a single DHT participant over UDP.
//!
//! Reads `$CERTDHT_HOME/config.toml`, loads key material from the node's
//! runtime directory, joins through the configured seed and serves until
//! Ctrl-C.

mod config;

use std::sync::Arc;

use certdht_dht::pki::FsDirectory;
use certdht_dht::DhtNode;
use certdht_transport::UdpTransport;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::load()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(name = %config.node.name, "certdht node starting");

    let strategy = config.adversary.strategy()?;
    let directory = Arc::new(FsDirectory::new(
        config.runtimes_dir(),
        &config.node.name,
        config.ca_certificate(),
    ));
    let (transport, inbound) =
        UdpTransport::bind(config.listen_addr(), &config.dht.network).await?;

    let node = DhtNode::start(config.dht.clone(), directory, transport, inbound, strategy).await?;
    info!(node = %node.info(), "listening");

    let interrupted = tokio::select! {
        result = node.bootstrap(&config.bootstrap.seeds) => {
            match result {
                Ok(report) => info!(
                    seed = ?report.seed,
                    peers = report.peers_discovered,
                    "joined network"
                ),
                Err(e) => error!(error = %e, kind = %e.kind(), "bootstrap failed"),
            }
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if !interrupted {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Ctrl-C received, shutting down");
    node.shutdown();

    info!("node stopped");
    Ok(())
}
