#![warn(missing_docs)]

//! Stratum topology directory: the authoritative, durable registry of pools,
//! zones, servers, chunkservers and copysets for a block-storage cluster.

pub mod cli;
pub mod config;
pub mod error;
pub mod file_store;
pub mod flusher;
pub mod id_generator;
pub mod kvstore;
pub mod storage;
pub mod token;
pub mod topology;
pub mod types;

pub use config::TopologyConfig;
pub use error::{EntityKind, StoreError, TopologyError, TopologyResult};
pub use file_store::FileKvStore;
pub use flusher::StateFlusher;
pub use id_generator::{DefaultIdGenerator, IdGenerator, IdWatermarks};
pub use kvstore::{KvStore, MemoryKvStore};
pub use storage::{KvTopologyStorage, TopologyStorage};
pub use token::{DefaultTokenGenerator, TokenGenerator};
pub use topology::{Topology, TopologySummary};
pub use types::{
    ChunkServer, ChunkServerId, ChunkServerState, ChunkServerStatus, CopySetId, CopySetInfo,
    CopySetKey, DiskState, LogicalPool, LogicalPoolStatus, LogicalPoolType, PhysicalPool, PoolId,
    PoolPolicy, Server, ServerId, Zone, ZoneId,
};
