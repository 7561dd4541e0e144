use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use p2beer::{DhtConfig, Endpoint, Node, NodeConfig, PeerId};

#[derive(Parser, Debug)]
#[command(name = "p2beer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on (0 picks a free one).
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Peer to join through, as IP:PORT or /ipv4/IP:PORT/.
    #[arg(short = 'B', long = "bootstrap", value_name = "ENDPOINT")]
    bootstrap: Vec<Endpoint>,

    /// Derive a stable peer id from this string.
    #[arg(short, long)]
    seed: Option<String>,

    #[arg(long, default_value = "20")]
    k: usize,

    #[arg(long, default_value = "3")]
    alpha: usize,

    /// Seconds between routing table reports.
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = NodeConfig {
        listen_port: args.port,
        peer_id: args.seed.as_deref().map(|seed| PeerId::from_seed(seed.as_bytes())),
        dht: DhtConfig {
            k: args.k,
            alpha: args.alpha,
            ..DhtConfig::default()
        },
        ..NodeConfig::default()
    };
    let node = Node::start(config).await?;
    info!(
        "Node {} listening on {}",
        node.peer_id(),
        node.listener_endpoint().map(|e| e.to_string()).unwrap_or_default()
    );

    for endpoint in &args.bootstrap {
        info!("Bootstrapping from {}", endpoint);
        match node.bootstrap(endpoint).await {
            Ok(()) => info!("Bootstrap complete"),
            Err(e) => warn!(error = %e, "Bootstrap failed"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let peers = node.known_peers().await;
                info!(known_peers = peers.len(), "routing table status");
            }
        }
    }

    node.shutdown();
    Ok(())
}
