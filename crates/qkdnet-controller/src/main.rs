//! Controller binary.
//!
//! # Usage
//!
//! ```bash
//! # Controller for a three-KME line, path table built once both links exist
//! qkdnet-controller --bind 127.0.0.1:5000 --expected-nodes 3 --expected-links 2
//!
//! # Controller whose KMEs prefetch two keys, overhead spread over the batch
//! qkdnet-controller --prefetch 2 --overhead-policy amortized
//! ```

use std::{error::Error, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use qkdnet_controller::{ControllerDriver, ControllerNode};
use qkdnet_core::{ControllerConfig, OverheadPolicy};
use qkdnet_transport::{QuicNetwork, QuicServer, SystemEnv};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    /// Each prefetched key costs a full key's rate
    Additive,
    /// The prefetch batch is spread over the keys it serves
    Amortized,
}

impl From<Policy> for OverheadPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Additive => Self::Additive,
            Policy::Amortized => Self::Amortized,
        }
    }
}

/// QKD SDN controller
#[derive(Parser, Debug)]
#[command(name = "qkdnet-controller")]
#[command(about = "QKD network emulator path and admission controller")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Seconds an unmatched registration waits for its counterpart
    #[arg(long, default_value = "15")]
    pending_ttl_secs: u64,

    /// Seconds of rate samples each link's capacity estimate spans
    #[arg(long, default_value = "15")]
    capacity_window_secs: u64,

    /// Expected seconds between rate reports
    #[arg(long, default_value = "1")]
    sample_interval_secs: u64,

    /// Prefetch count the KMEs run with
    #[arg(long, default_value = "0")]
    prefetch: usize,

    /// How prefetch overhead is charged to a relayed path's first edge
    #[arg(long, value_enum, default_value = "additive")]
    overhead_policy: Policy,

    /// Build the path table once this many KMEs have registered
    #[arg(long)]
    expected_nodes: Option<usize>,

    /// Build the path table once this many links are confirmed
    #[arg(long)]
    expected_links: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            pending_ttl: Duration::from_secs(self.pending_ttl_secs),
            capacity_window: Duration::from_secs(self.capacity_window_secs),
            sample_interval: Duration::from_secs(self.sample_interval_secs),
            prefetch_keys: self.prefetch,
            overhead_policy: self.overhead_policy.into(),
            expected_nodes: self.expected_nodes,
            expected_links: self.expected_links,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = args.config();
    config.validate()?;

    let server = QuicServer::bind(&args.bind, args.cert.clone(), args.key.clone())?;
    let addr = server.local_addr()?;

    // The controller never calls itself; its own address fills the slot.
    let network = Arc::new(QuicNetwork::new(&addr.to_string())?);
    let driver = ControllerDriver::new(SystemEnv::new(), config)?;
    let node = Arc::new(ControllerNode::new(driver, network));

    tracing::info!(%addr, "controller serving");
    server.serve(node).await?;
    Ok(())
}
