//! KME binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory KME registering with a local controller
//! qkdnet-kme --bind 127.0.0.1:5001 --controller 127.0.0.1:5000
//!
//! # Persistent KME with prefetching
//! qkdnet-kme --bind 127.0.0.1:5002 --controller 127.0.0.1:5000 --db kme2.redb --prefetch 4
//! ```

use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use qkdnet_core::{KmeConfig, KmeId};
use qkdnet_kme::{KmeDriver, KmeNode, MemoryStorage, RedbStorage, Storage, register};
use qkdnet_transport::{QuicNetwork, QuicServer, SystemEnv};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// QKD Key Management Entity
#[derive(Parser, Debug)]
#[command(name = "qkdnet-kme")]
#[command(about = "QKD network emulator key management entity")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:5001")]
    bind: String,

    /// Address announced to the controller (defaults to the bound address)
    #[arg(long)]
    advertise: Option<String>,

    /// Controller address
    #[arg(long, default_value = "127.0.0.1:5000")]
    controller: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// redb database file; state is kept in memory if absent
    #[arg(long)]
    db: Option<PathBuf>,

    /// Block lifetime in seconds
    #[arg(long, default_value = "15")]
    ttl_secs: u64,

    /// Smallest key size in bits
    #[arg(long, default_value = "64")]
    min_key_size: u32,

    /// Largest key size in bits
    #[arg(long, default_value = "1024")]
    max_key_size: u32,

    /// Key size in bits when a request names none
    #[arg(long, default_value = "256")]
    default_key_size: u32,

    /// Extra keys generated per batch for later requests
    #[arg(long, default_value = "0")]
    prefetch: usize,

    /// Upper bound on keys in one request
    #[arg(long, default_value = "128")]
    max_keys_per_request: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> KmeConfig {
        KmeConfig {
            db_url: self.db.clone(),
            ttl: Duration::from_secs(self.ttl_secs),
            min_key_size: self.min_key_size,
            max_key_size: self.max_key_size,
            default_key_size: self.default_key_size,
            prefetch_keys: self.prefetch,
            max_keys_per_request: self.max_keys_per_request,
            ..KmeConfig::default()
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
    let advertise = match &args.advertise {
        Some(address) => address.clone(),
        None => server.local_addr()?.to_string(),
    };

    let network = Arc::new(QuicNetwork::new(&args.controller)?);
    let id = register(network.as_ref(), &advertise).await?;

    match config.db_url.clone() {
        Some(path) => {
            tracing::info!(path = %path.display(), "using redb storage");
            run(server, network, id, config, RedbStorage::open(&path)?).await
        },
        None => run(server, network, id, config, MemoryStorage::new()).await,
    }
}

async fn run<S: Storage>(
    server: QuicServer,
    network: Arc<QuicNetwork>,
    id: KmeId,
    config: KmeConfig,
    storage: S,
) -> Result<(), Box<dyn Error>> {
    let driver = KmeDriver::open(SystemEnv::new(), id, config, storage)?;
    let node = Arc::new(KmeNode::new(driver, network));

    tracing::info!(kme = %id, addr = %server.local_addr()?, "kme serving");
    server.serve(node).await?;
    Ok(())
}
