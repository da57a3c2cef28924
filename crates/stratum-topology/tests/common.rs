//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stratum_topology::kvstore::{Key, KvPair, Value};
use stratum_topology::{
    ChunkServer, ChunkServerId, ChunkServerState, DefaultIdGenerator, DefaultTokenGenerator,
    KvStore, KvTopologyStorage, LogicalPool, LogicalPoolStatus, LogicalPoolType, MemoryKvStore,
    PoolId, PoolPolicy, Server, ServerId, StoreError, Topology, ZoneId,
};

/// In-memory store whose writes can be switched to fail.
#[derive(Default)]
pub struct FaultyKvStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
}

impl FaultyKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl KvStore for FaultyKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError> {
        self.inner.get(key)
    }

    fn put(&self, key: Key, value: Value) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        self.inner.scan_prefix(prefix)
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.inner.contains_key(key)
    }
}

/// Builds and initializes a directory over `kv`.
pub fn topology_over(kv: Arc<dyn KvStore>) -> Topology {
    let topo = Topology::new(
        Arc::new(DefaultIdGenerator::new()),
        Arc::new(DefaultTokenGenerator::default()),
        Arc::new(KvTopologyStorage::new(kv)),
    );
    topo.init().expect("init on a consistent store");
    topo
}

/// A fresh in-memory directory.
pub fn memory_topology() -> Topology {
    topology_over(Arc::new(MemoryKvStore::new()))
}

pub fn server(id: ServerId, zone: ZoneId, hostname: &str, ip: &str) -> Server {
    Server {
        id,
        hostname: hostname.to_string(),
        internal_ip: ip.to_string(),
        internal_port: 0,
        external_ip: String::new(),
        external_port: 0,
        zone_id: zone,
        desc: String::new(),
    }
}

pub fn chunk_server(
    id: ChunkServerId,
    server: ServerId,
    token: &str,
    ip: &str,
    port: u32,
) -> ChunkServer {
    ChunkServer {
        id,
        token: token.to_string(),
        disk_type: "nvme".to_string(),
        server_id: server,
        host_ip: ip.to_string(),
        port,
        mount_point: format!("/data/chunkserver{}", id),
        state: ChunkServerState::default(),
    }
}

pub fn logical_pool(id: PoolId, name: &str, physical: PoolId) -> LogicalPool {
    LogicalPool {
        id,
        name: name.to_string(),
        physical_pool_id: physical,
        pool_type: LogicalPoolType::PageFile,
        policy: PoolPolicy::default(),
        create_time: 1_700_000_000,
        status: LogicalPoolStatus::Allocatable,
    }
}
