//! The master binary: parses CLI flags, loads `MasterConfig`, stands up an
//! `InMemorySysCatalog`-backed `MasterService`, and runs until signalled.
//!
//! The Sys-Catalog Store here is the in-memory stand-in from `cm-syscatalog`
//! (a production build replaces it with a client of the replicated log,
//! explicitly out of scope per §1); this binary exists to exercise the
//! wiring, not to be a deployable master.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cm_catalog::EntityRegistry;
use cm_master::{spawn_background_loops, MasterConfig, MasterService, NoopCallHomeCollector};
use cm_syscatalog::InMemorySysCatalog;
use cm_types::LeaderTerm;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cm-masterd", about = "Catalog Manager / Load Balancer master process")]
struct Args {
    /// Path to a JSON file of `MasterConfig` overrides. Missing file or
    /// unset flag means "use built-in defaults".
    #[arg(long, env = "CM_MASTER_CONFIG")]
    config: Option<PathBuf>,

    /// Liveness window a tablet server must heartbeat within to count as
    /// live (§4.3).
    #[arg(long, env = "CM_MASTER_TS_LIVENESS_SECS", default_value_t = 15)]
    ts_liveness_secs: u64,

    /// Seed for the balancer's tie-breaking RNG (§4.5); fixed by default so
    /// a given run is reproducible.
    #[arg(long, env = "CM_MASTER_BALANCER_SEED", default_value_t = 0)]
    balancer_seed: u64,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MasterConfig> {
    match path {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            Ok(serde_json::from_slice(&bytes)?)
        }
        None => Ok(MasterConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let registry = Arc::new(EntityRegistry::new());
    let store: Arc<InMemorySysCatalog> = Arc::new(InMemorySysCatalog::new(LeaderTerm(1)));

    let service = Arc::new(MasterService::new(
        config,
        registry,
        store,
        Arc::new(cm_ts_manager::SystemClock),
        Duration::from_secs(args.ts_liveness_secs),
        Arc::new(NoTabletServerAgent),
        Arc::new(NoProducerCluster),
        Arc::new(NoopCallHomeCollector),
        args.balancer_seed,
    ));

    service.become_leader().await?;
    let background = spawn_background_loops(service);

    tracing::info!("cm-masterd running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    for handle in background {
        handle.abort();
    }
    Ok(())
}

/// Placeholder tablet-server RPC client: transport is out of scope (§1).
/// Every call reports failure so a real deployment is forced to supply its
/// own implementation rather than silently relying on this stub.
struct NoTabletServerAgent;

#[async_trait::async_trait]
impl cm_snapshot::SnapshotAgent for NoTabletServerAgent {
    async fn create_tablet_snapshot(&self, _tablet_id: &cm_types::TabletId, _snapshot_id: &cm_types::SnapshotId) -> bool {
        false
    }
    async fn restore_tablet_snapshot(&self, _tablet_id: &cm_types::TabletId, _snapshot_id: &cm_types::SnapshotId) -> bool {
        false
    }
    async fn delete_tablet_snapshot(&self, _tablet_id: &cm_types::TabletId, _snapshot_id: &cm_types::SnapshotId) -> bool {
        false
    }
}

/// Placeholder producer-cluster RPC client, for the same reason.
struct NoProducerCluster;

#[async_trait::async_trait]
impl cm_cdc::ProducerClient for NoProducerCluster {
    async fn fetch_table_schema(&self, _producer_table_id: &str) -> Option<cm_cdc::ProducerTableInfo> {
        None
    }
    async fn list_tablets(&self, _producer_table_id: &str) -> Vec<cm_cdc::ProducerTabletInfo> {
        Vec::new()
    }
    async fn create_stream(&self, _producer_table_id: &str) -> Option<String> {
        None
    }
    async fn verify_bootstrap_id(&self, _bootstrap_id: &str, _producer_table_id: &str) -> bool {
        false
    }
    async fn delete_stream(&self, _stream_id: &str) -> bool {
        false
    }
}
