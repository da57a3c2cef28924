//! Durable storage contract for topology records.
//!
//! `KvTopologyStorage` lays records out in a [`KvStore`] with key format
//! `topo/{kind}/{id_be}` (copysets: `topo/copyset/{pool_be}{copyset_be}`), so a
//! prefix scan per kind loads everything back in id order. Values are bincode.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::kvstore::KvStore;
use crate::types::{
    ChunkServer, ChunkServerId, CopySetInfo, CopySetKey, LogicalPool, PhysicalPool, PoolId,
    Server, ServerId, Zone, ZoneId,
};

/// Persistence operations the directory relies on.
///
/// `insert_*` fails if the key is already stored; `update_*` overwrites;
/// `delete_*` is idempotent. Every call is durable when it returns `Ok`.
pub trait TopologyStorage: Send + Sync {
    /// Loads every persisted logical pool.
    fn load_logical_pools(&self) -> Result<Vec<LogicalPool>, StoreError>;
    /// Loads every persisted physical pool.
    fn load_physical_pools(&self) -> Result<Vec<PhysicalPool>, StoreError>;
    /// Loads every persisted zone.
    fn load_zones(&self) -> Result<Vec<Zone>, StoreError>;
    /// Loads every persisted server.
    fn load_servers(&self) -> Result<Vec<Server>, StoreError>;
    /// Loads every persisted chunkserver.
    fn load_chunk_servers(&self) -> Result<Vec<ChunkServer>, StoreError>;
    /// Loads every persisted copyset.
    fn load_copysets(&self) -> Result<Vec<CopySetInfo>, StoreError>;

    /// Persists a new logical pool.
    fn insert_logical_pool(&self, data: &LogicalPool) -> Result<(), StoreError>;
    /// Persists a new physical pool.
    fn insert_physical_pool(&self, data: &PhysicalPool) -> Result<(), StoreError>;
    /// Persists a new zone.
    fn insert_zone(&self, data: &Zone) -> Result<(), StoreError>;
    /// Persists a new server.
    fn insert_server(&self, data: &Server) -> Result<(), StoreError>;
    /// Persists a new chunkserver.
    fn insert_chunk_server(&self, data: &ChunkServer) -> Result<(), StoreError>;
    /// Persists a new copyset.
    fn insert_copyset(&self, data: &CopySetInfo) -> Result<(), StoreError>;

    /// Overwrites a logical pool.
    fn update_logical_pool(&self, data: &LogicalPool) -> Result<(), StoreError>;
    /// Overwrites a physical pool.
    fn update_physical_pool(&self, data: &PhysicalPool) -> Result<(), StoreError>;
    /// Overwrites a zone.
    fn update_zone(&self, data: &Zone) -> Result<(), StoreError>;
    /// Overwrites a server.
    fn update_server(&self, data: &Server) -> Result<(), StoreError>;
    /// Overwrites a chunkserver.
    fn update_chunk_server(&self, data: &ChunkServer) -> Result<(), StoreError>;
    /// Overwrites a copyset.
    fn update_copyset(&self, data: &CopySetInfo) -> Result<(), StoreError>;

    /// Deletes a logical pool.
    fn delete_logical_pool(&self, id: PoolId) -> Result<(), StoreError>;
    /// Deletes a physical pool.
    fn delete_physical_pool(&self, id: PoolId) -> Result<(), StoreError>;
    /// Deletes a zone.
    fn delete_zone(&self, id: ZoneId) -> Result<(), StoreError>;
    /// Deletes a server.
    fn delete_server(&self, id: ServerId) -> Result<(), StoreError>;
    /// Deletes a chunkserver.
    fn delete_chunk_server(&self, id: ChunkServerId) -> Result<(), StoreError>;
    /// Deletes a copyset.
    fn delete_copyset(&self, key: CopySetKey) -> Result<(), StoreError>;
}

const LOGICAL_POOL_PREFIX: &[u8] = b"topo/logicalpool/";
const PHYSICAL_POOL_PREFIX: &[u8] = b"topo/physicalpool/";
const ZONE_PREFIX: &[u8] = b"topo/zone/";
const SERVER_PREFIX: &[u8] = b"topo/server/";
const CHUNK_SERVER_PREFIX: &[u8] = b"topo/chunkserver/";
const COPYSET_PREFIX: &[u8] = b"topo/copyset/";

fn id_key(prefix: &[u8], id: u32) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn copyset_key(key: CopySetKey) -> Vec<u8> {
    let mut out = COPYSET_PREFIX.to_vec();
    out.extend_from_slice(&key.logical_pool_id.as_u32().to_be_bytes());
    out.extend_from_slice(&key.copyset_id.as_u32().to_be_bytes());
    out
}

/// [`TopologyStorage`] on top of any [`KvStore`].
pub struct KvTopologyStorage {
    kv: Arc<dyn KvStore>,
}

impl KvTopologyStorage {
    /// Creates a storage adapter over `kv`.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn load<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        self.kv
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(_key, value)| bincode::deserialize(&value).map_err(StoreError::from))
            .collect()
    }

    fn insert<T: Serialize>(&self, key: Vec<u8>, data: &T) -> Result<(), StoreError> {
        if self.kv.contains_key(&key)? {
            return Err(StoreError::Rejected(format!(
                "key {} already stored",
                String::from_utf8_lossy(&key)
            )));
        }
        let value = bincode::serialize(data)?;
        self.kv.put(key, value)
    }

    fn update<T: Serialize>(&self, key: Vec<u8>, data: &T) -> Result<(), StoreError> {
        let value = bincode::serialize(data)?;
        self.kv.put(key, value)
    }
}

impl TopologyStorage for KvTopologyStorage {
    fn load_logical_pools(&self) -> Result<Vec<LogicalPool>, StoreError> {
        self.load(LOGICAL_POOL_PREFIX)
    }

    fn load_physical_pools(&self) -> Result<Vec<PhysicalPool>, StoreError> {
        self.load(PHYSICAL_POOL_PREFIX)
    }

    fn load_zones(&self) -> Result<Vec<Zone>, StoreError> {
        self.load(ZONE_PREFIX)
    }

    fn load_servers(&self) -> Result<Vec<Server>, StoreError> {
        self.load(SERVER_PREFIX)
    }

    fn load_chunk_servers(&self) -> Result<Vec<ChunkServer>, StoreError> {
        self.load(CHUNK_SERVER_PREFIX)
    }

    fn load_copysets(&self) -> Result<Vec<CopySetInfo>, StoreError> {
        self.load(COPYSET_PREFIX)
    }

    fn insert_logical_pool(&self, data: &LogicalPool) -> Result<(), StoreError> {
        self.insert(id_key(LOGICAL_POOL_PREFIX, data.id.as_u32()), data)
    }

    fn insert_physical_pool(&self, data: &PhysicalPool) -> Result<(), StoreError> {
        self.insert(id_key(PHYSICAL_POOL_PREFIX, data.id.as_u32()), data)
    }

    fn insert_zone(&self, data: &Zone) -> Result<(), StoreError> {
        self.insert(id_key(ZONE_PREFIX, data.id.as_u32()), data)
    }

    fn insert_server(&self, data: &Server) -> Result<(), StoreError> {
        self.insert(id_key(SERVER_PREFIX, data.id.as_u32()), data)
    }

    fn insert_chunk_server(&self, data: &ChunkServer) -> Result<(), StoreError> {
        self.insert(id_key(CHUNK_SERVER_PREFIX, data.id.as_u32()), data)
    }

    fn insert_copyset(&self, data: &CopySetInfo) -> Result<(), StoreError> {
        self.insert(copyset_key(data.key()), data)
    }

    fn update_logical_pool(&self, data: &LogicalPool) -> Result<(), StoreError> {
        self.update(id_key(LOGICAL_POOL_PREFIX, data.id.as_u32()), data)
    }

    fn update_physical_pool(&self, data: &PhysicalPool) -> Result<(), StoreError> {
        self.update(id_key(PHYSICAL_POOL_PREFIX, data.id.as_u32()), data)
    }

    fn update_zone(&self, data: &Zone) -> Result<(), StoreError> {
        self.update(id_key(ZONE_PREFIX, data.id.as_u32()), data)
    }

    fn update_server(&self, data: &Server) -> Result<(), StoreError> {
        self.update(id_key(SERVER_PREFIX, data.id.as_u32()), data)
    }

    fn update_chunk_server(&self, data: &ChunkServer) -> Result<(), StoreError> {
        self.update(id_key(CHUNK_SERVER_PREFIX, data.id.as_u32()), data)
    }

    fn update_copyset(&self, data: &CopySetInfo) -> Result<(), StoreError> {
        self.update(copyset_key(data.key()), data)
    }

    fn delete_logical_pool(&self, id: PoolId) -> Result<(), StoreError> {
        self.kv.delete(&id_key(LOGICAL_POOL_PREFIX, id.as_u32()))
    }

    fn delete_physical_pool(&self, id: PoolId) -> Result<(), StoreError> {
        self.kv.delete(&id_key(PHYSICAL_POOL_PREFIX, id.as_u32()))
    }

    fn delete_zone(&self, id: ZoneId) -> Result<(), StoreError> {
        self.kv.delete(&id_key(ZONE_PREFIX, id.as_u32()))
    }

    fn delete_server(&self, id: ServerId) -> Result<(), StoreError> {
        self.kv.delete(&id_key(SERVER_PREFIX, id.as_u32()))
    }

    fn delete_chunk_server(&self, id: ChunkServerId) -> Result<(), StoreError> {
        self.kv.delete(&id_key(CHUNK_SERVER_PREFIX, id.as_u32()))
    }

    fn delete_copyset(&self, key: CopySetKey) -> Result<(), StoreError> {
        self.kv.delete(&copyset_key(key))
    }
}
