//! Identifier allocation for topology entities.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::types::{ChunkServerId, CopySetId, PoolId, ServerId, ZoneId};

/// Highest id in use per kind, gathered from storage by `Topology::init`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdWatermarks {
    /// Largest logical pool id.
    pub logical_pool: u32,
    /// Largest physical pool id.
    pub physical_pool: u32,
    /// Largest zone id.
    pub zone: u32,
    /// Largest server id.
    pub server: u32,
    /// Largest chunkserver id.
    pub chunk_server: u32,
    /// Largest copyset id per logical pool.
    pub copysets: HashMap<PoolId, u32>,
}

/// Issues ids that are never reused.
pub trait IdGenerator: Send + Sync {
    /// Raises every counter to at least the given watermarks.
    fn init(&self, watermarks: &IdWatermarks);

    /// Next logical pool id.
    fn gen_logical_pool_id(&self) -> PoolId;
    /// Next physical pool id.
    fn gen_physical_pool_id(&self) -> PoolId;
    /// Next zone id.
    fn gen_zone_id(&self) -> ZoneId;
    /// Next server id.
    fn gen_server_id(&self) -> ServerId;
    /// Next chunkserver id.
    fn gen_chunk_server_id(&self) -> ChunkServerId;
    /// Next copyset id within `logical_pool_id`.
    fn gen_copyset_id(&self, logical_pool_id: PoolId) -> CopySetId;
}

/// Monotonic in-process counters. Ids start at 1.
#[derive(Default)]
pub struct DefaultIdGenerator {
    logical_pool: AtomicU32,
    physical_pool: AtomicU32,
    zone: AtomicU32,
    server: AtomicU32,
    chunk_server: AtomicU32,
    copysets: Mutex<HashMap<PoolId, u32>>,
}

impl DefaultIdGenerator {
    /// Creates a generator whose first id of every kind is 1.
    pub fn new() -> Self {
        Self::default()
    }
}

fn next(counter: &AtomicU32) -> u32 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

impl IdGenerator for DefaultIdGenerator {
    fn init(&self, watermarks: &IdWatermarks) {
        self.logical_pool
            .fetch_max(watermarks.logical_pool, Ordering::SeqCst);
        self.physical_pool
            .fetch_max(watermarks.physical_pool, Ordering::SeqCst);
        self.zone.fetch_max(watermarks.zone, Ordering::SeqCst);
        self.server.fetch_max(watermarks.server, Ordering::SeqCst);
        self.chunk_server
            .fetch_max(watermarks.chunk_server, Ordering::SeqCst);

        let mut copysets = self
            .copysets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (pool, max) in &watermarks.copysets {
            let current = copysets.entry(*pool).or_insert(0);
            *current = (*current).max(*max);
        }
    }

    fn gen_logical_pool_id(&self) -> PoolId {
        PoolId::new(next(&self.logical_pool))
    }

    fn gen_physical_pool_id(&self) -> PoolId {
        PoolId::new(next(&self.physical_pool))
    }

    fn gen_zone_id(&self) -> ZoneId {
        ZoneId::new(next(&self.zone))
    }

    fn gen_server_id(&self) -> ServerId {
        ServerId::new(next(&self.server))
    }

    fn gen_chunk_server_id(&self) -> ChunkServerId {
        ChunkServerId::new(next(&self.chunk_server))
    }

    fn gen_copyset_id(&self, logical_pool_id: PoolId) -> CopySetId {
        let mut copysets = self
            .copysets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = copysets.entry(logical_pool_id).or_insert(0);
        *counter += 1;
        CopySetId::new(*counter)
    }
}
