//! Registry node binary

use clap::{Parser, Subcommand};
use minireg::{
    coordination::MemoryCoordinationService,
    store::{MemorySchemaStore, RocksSchemaStore, SchemaStore},
    NodeConfig, RegistryNode,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minireg")]
#[command(about = "minireg schema registry node with master election")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a registry node
    Serve {
        /// Config file (TOML); MINIREG_* env vars apply on top
        #[arg(long)]
        config: Option<PathBuf>,

        /// Advertised host
        #[arg(long)]
        host: Option<String>,

        /// Advertised port
        #[arg(long)]
        port: Option<u16>,

        /// Bind address for the admin API
        #[arg(long)]
        bind: Option<String>,

        /// Never contend for mastership
        #[arg(long)]
        ineligible: bool,

        /// Ids reserved per counter write
        #[arg(long)]
        batch_size: Option<i64>,

        /// RocksDB directory (in-memory store if omitted)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            bind,
            ineligible,
            batch_size,
            data_dir,
        } => {
            // file and env first, CLI has priority
            let mut node_config = NodeConfig::load(config.as_deref())?;
            if let Some(host) = host {
                node_config.host = host;
            }
            if let Some(port) = port {
                node_config.port = port;
            }
            if let Some(bind) = bind {
                node_config.bind_addr = bind.parse()?;
            }
            if ineligible {
                node_config.master_eligible = false;
            }
            if let Some(batch_size) = batch_size {
                node_config.id_batch_size = batch_size;
            }
            if data_dir.is_some() {
                node_config.data_dir = data_dir;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| node_config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let store: Arc<dyn SchemaStore> = match &node_config.data_dir {
                Some(dir) => Arc::new(RocksSchemaStore::open(dir)?),
                None => {
                    tracing::warn!("No data dir configured, schemas are kept in memory");
                    Arc::new(MemorySchemaStore::new())
                }
            };

            // single-process cluster; a networked client plugs in here
            let service = MemoryCoordinationService::new();
            let node = RegistryNode::start(node_config, service.connect(), store).await?;
            Arc::new(node).serve().await?;
        }
    }

    Ok(())
}
