use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use twinfs_coordinator::{Coordinator, InMemoryCoordinator};
use twinfs_datanode::offer::BufferedOfferFactory;
use twinfs_datanode::settings::{Settings, StartupOption};
use twinfs_datanode::storage::{
    validate_data_dirs, BlockStore, DiskStorage, SimulatedStorage, Storage,
};
use twinfs_datanode::{DataNode, NodeContext};
use twinfs_net::{DnsResolver, TcpConnector};
use twinfs_types::NamespaceId;

/// twinfs data node: serves blocks for namespaces managed by paired
/// metadata servers.
#[derive(Parser, Debug)]
#[command(name = "twinfs-datanode", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "datanode.toml")]
    config: String,

    /// Roll the storage state back before serving
    #[arg(long, conflicts_with = "regular")]
    rollback: bool,

    /// Regular startup (the default)
    #[arg(long)]
    regular: bool,
}

/// Accept the historical single-dash spellings and reject the retired rack
/// flags before clap sees them.
fn normalized_args() -> anyhow::Result<Vec<String>> {
    let mut args = Vec::new();
    for arg in std::env::args() {
        match arg.as_str() {
            "-r" | "--rack" => anyhow::bail!(
                "-r and --rack are not supported anymore; rack resolution \
                 is handled by the metadata servers"
            ),
            "-rollback" => args.push("--rollback".to_string()),
            "-regular" => args.push("--regular".to_string()),
            _ => args.push(arg),
        }
    }
    Ok(args)
}

/// Block-store registration for the local replica tree. Replica I/O itself
/// lives outside the namespace service manager.
#[derive(Default)]
struct LocalBlockStore {
    namespaces: Mutex<HashSet<NamespaceId>>,
}

impl BlockStore for LocalBlockStore {
    fn add_namespace(&self, ns: NamespaceId, dir: &Path) {
        if self.namespaces.lock().insert(ns) {
            info!(namespace_id = *ns, dir = %dir.display(), "block store serving namespace");
        }
    }

    fn remove_namespace(&self, ns: NamespaceId) {
        if self.namespaces.lock().remove(&ns) {
            info!(namespace_id = *ns, "block store dropped namespace");
        }
    }
}

/// Turn the first interrupt or termination signal into the node-wide
/// shutdown cascade.
async fn shutdown_on_signal(node: Arc<DataNode>) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, interrupt only");
                None
            }
        };
    let terminated = async {
        match sigterm.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt signal, stopping the data node"),
        _ = terminated => info!("termination signal, stopping the data node"),
    }
    node.shutdown_dn().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse_from(normalized_args()?);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut settings = Settings::from_toml_file(&args.config)?;
    if args.rollback {
        settings.startup = StartupOption::Rollback;
    } else if args.regular {
        settings.startup = StartupOption::Regular;
    }

    info!(
        config = %args.config,
        namespaces = settings.namespaces.len(),
        startup = ?settings.startup,
        "starting twinfs data node"
    );

    let storage: Arc<dyn Storage> = if settings.simulated_storage {
        Arc::new(SimulatedStorage::new())
    } else {
        let usable = validate_data_dirs(&settings.data_dirs)?;
        settings.data_dirs = usable.clone();
        Arc::new(DiskStorage::new(usable))
    };

    let coordinator = InMemoryCoordinator::new();
    for (default_addr, primary) in &settings.coordinator_seed {
        coordinator.publish_primary(default_addr.clone(), primary.clone());
    }
    let coordinator_proto = coordinator.clone();

    let ctx = NodeContext::new(
        settings,
        storage,
        Arc::new(LocalBlockStore::default()),
        None,
        Arc::new(TcpConnector::default()),
        Arc::new(DnsResolver),
        Arc::new(BufferedOfferFactory),
        Arc::new(move || Arc::new(coordinator_proto.clone()) as Arc<dyn Coordinator>),
    );

    let node = DataNode::new(ctx)?;
    tokio::spawn(shutdown_on_signal(node.clone()));

    node.run().await?;
    info!("twinfs data node shut down cleanly");
    Ok(())
}
