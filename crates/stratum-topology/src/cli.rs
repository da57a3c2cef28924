//! Command-line front end of `stratum-topo`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::TopologyConfig;
use crate::file_store::FileKvStore;
use crate::flusher::StateFlusher;
use crate::id_generator::DefaultIdGenerator;
use crate::kvstore::{KvStore, MemoryKvStore};
use crate::storage::KvTopologyStorage;
use crate::token::DefaultTokenGenerator;
use crate::topology::{Topology, TopologySummary};
use crate::types::{ChunkServer, CopySetInfo, LogicalPool, PhysicalPool, Server, Zone};

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "stratum-topo")]
#[command(about = "Stratum cluster topology directory", long_about = None)]
pub struct Cli {
    /// Config file (.toml or .json). Defaults apply when absent.
    #[arg(short, long, env = "STRATUM_TOPO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `data_dir` from the config file.
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Load the topology and flush chunkserver states until Ctrl-C.
    Serve,
    /// Load the topology and print it as JSON.
    Show {
        /// Print only per-kind counts.
        #[arg(short, long)]
        summary: bool,
    },
}

/// Every live record, as printed by `show`.
#[derive(Debug, Serialize)]
pub struct TopologyDump {
    /// Physical pools.
    pub physical_pools: Vec<PhysicalPool>,
    /// Zones.
    pub zones: Vec<Zone>,
    /// Servers.
    pub servers: Vec<Server>,
    /// Chunkservers with their current state.
    pub chunk_servers: Vec<ChunkServer>,
    /// Logical pools.
    pub logical_pools: Vec<LogicalPool>,
    /// Copysets.
    pub copysets: Vec<CopySetInfo>,
}

impl TopologyDump {
    /// Collects every record from `topology`.
    pub fn collect(topology: &Topology) -> Self {
        Self {
            physical_pools: topology
                .physical_pools_in_cluster()
                .into_iter()
                .filter_map(|id| topology.get_physical_pool(id))
                .collect(),
            zones: topology
                .zones_in_cluster()
                .into_iter()
                .filter_map(|id| topology.get_zone(id))
                .collect(),
            servers: topology
                .servers_in_cluster()
                .into_iter()
                .filter_map(|id| topology.get_server(id))
                .collect(),
            chunk_servers: topology
                .chunk_servers_in_cluster()
                .into_iter()
                .filter_map(|id| topology.get_chunk_server(id))
                .collect(),
            logical_pools: topology
                .logical_pools_in_cluster()
                .into_iter()
                .filter_map(|id| topology.get_logical_pool(id))
                .collect(),
            copysets: topology
                .copysets_in_cluster()
                .into_iter()
                .filter_map(|key| topology.get_copyset(key))
                .collect(),
        }
    }
}

/// A loaded directory plus the file store under it, if any.
pub struct OpenedTopology {
    /// The directory, after a successful `init`.
    pub topology: Arc<Topology>,
    /// Present when `data_dir` was configured.
    pub file_store: Option<Arc<FileKvStore>>,
}

/// Opens the configured store, builds the directory and loads it.
pub fn open_topology(config: &TopologyConfig) -> Result<OpenedTopology> {
    let file_store = match &config.data_dir {
        Some(dir) => Some(Arc::new(FileKvStore::open(dir).with_context(|| {
            format!("failed to open topology store at {}", dir.display())
        })?)),
        None => {
            tracing::warn!("no data_dir configured; topology will not survive a restart");
            None
        }
    };
    let kv: Arc<dyn KvStore> = match &file_store {
        Some(store) => store.clone(),
        None => Arc::new(MemoryKvStore::new()),
    };

    let topology = Topology::new(
        Arc::new(DefaultIdGenerator::new()),
        Arc::new(DefaultTokenGenerator::new(config.token_length)),
        Arc::new(KvTopologyStorage::new(kv)),
    );
    topology.init()?;

    if config.compact_on_start {
        if let Some(store) = &file_store {
            store.compact()?;
        }
    }

    Ok(OpenedTopology {
        topology: Arc::new(topology),
        file_store,
    })
}

impl Cli {
    /// Resolves the effective config from the file and flags.
    pub fn load_config(&self) -> Result<TopologyConfig> {
        let mut config = match &self.config {
            Some(path) => TopologyConfig::from_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => TopologyConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        Ok(config)
    }

    /// Executes the selected subcommand.
    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Serve => serve(&config).await,
            Command::Show { summary } => {
                let opened = open_topology(&config)?;
                let out = if summary {
                    serde_json::to_string_pretty(&opened.topology.summary())?
                } else {
                    serde_json::to_string_pretty(&TopologyDump::collect(&opened.topology))?
                };
                println!("{}", out);
                Ok(())
            }
        }
    }
}

async fn serve(config: &TopologyConfig) -> Result<()> {
    let opened = open_topology(config)?;
    let summary: TopologySummary = opened.topology.summary();
    tracing::info!(?summary, "topology directory ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = StateFlusher::new(opened.topology.clone(), config.state_flush_interval());
    let flusher_handle = tokio::spawn(flusher.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    shutdown_tx.send(true)?;
    flusher_handle.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolId, Zone, ZoneId};
    use tempfile::TempDir;

    #[test]
    fn test_parse_show_summary() {
        let cli = Cli::try_parse_from(["stratum-topo", "--data-dir", "/tmp/t", "show", "--summary"])
            .unwrap();
        assert_eq!(cli.command, Command::Show { summary: true });
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/t")));
    }

    #[test]
    fn test_data_dir_flag_overrides_config() {
        let cli = Cli::try_parse_from(["stratum-topo", "-d", "/srv/topo", "serve"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/topo")));
        assert_eq!(config.state_flush_interval_secs, 60);
    }

    #[test]
    fn test_open_reloads_from_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = TopologyConfig {
            data_dir: Some(dir.path().to_path_buf()),
            compact_on_start: true,
            ..Default::default()
        };

        {
            let opened = open_topology(&config).unwrap();
            let topo = &opened.topology;
            topo.add_physical_pool(&PhysicalPool::new(PoolId::new(1), "pp", ""))
                .unwrap();
            topo.add_zone(&Zone::new(ZoneId::new(1), "z", PoolId::new(1), ""))
                .unwrap();
        }

        let opened = open_topology(&config).unwrap();
        assert!(opened.file_store.is_some());
        let dump = TopologyDump::collect(&opened.topology);
        assert_eq!(dump.physical_pools.len(), 1);
        assert_eq!(dump.zones[0].name, "z");
        assert!(dump.servers.is_empty());
    }
}
