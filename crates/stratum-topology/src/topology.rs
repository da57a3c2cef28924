//! The topology directory.
//!
//! `Topology` owns one map per entity kind, each behind its own `RwLock`.
//! Whenever an operation needs more than one map, it locks them in the order
//! the fields are declared:
//!
//! ```text
//! logical_pools -> physical_pools -> zones -> servers -> state_flush
//!     -> chunk_servers -> copysets
//! ```
//!
//! Guards are bound to locals in that same order, so they drop in reverse.
//! Every structural mutation is written to [`TopologyStorage`] while the
//! write lock is held and applied to the map only after the store accepted
//! it. The chunkserver state path is the one exception: it is memory-only and
//! reaches storage through [`Topology::flush_chunk_server_states`].
//!
//! `state_flush` serializes that flush against chunkserver removes and full
//! updates, so a flushed snapshot can never land after a remove or overwrite
//! a newer record. The flush holds it across its storage writes but holds the
//! chunkserver map lock only long enough to take snapshots, so heartbeat
//! state updates never wait on a flush's fsyncs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use serde::Serialize;

use crate::error::{EntityKind, TopologyError, TopologyResult};
use crate::id_generator::{IdGenerator, IdWatermarks};
use crate::storage::TopologyStorage;
use crate::token::TokenGenerator;
use crate::types::{
    ChunkServer, ChunkServerId, ChunkServerState, CopySetId, CopySetInfo, CopySetKey,
    LogicalPool, PhysicalPool, PoolId, Server, ServerId, Zone, ZoneId,
};

// Critical sections never leave a map half-updated before a fallible call,
// so a poisoned lock still guards consistent data.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A chunkserver as held in the map.
///
/// Structural fields live in `info` and only change under the map's write
/// lock. The live state lives in `state` so heartbeat updates need only the
/// shared map lock plus this record's mutex; `info.state` is not read.
struct ChunkServerSlot {
    info: ChunkServer,
    state: Mutex<ChunkServerState>,
    dirty: AtomicBool,
}

impl ChunkServerSlot {
    fn new(info: ChunkServer) -> Self {
        let state = Mutex::new(info.state);
        Self {
            info,
            state,
            dirty: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> ChunkServer {
        let mut out = self.info.clone();
        out.state = *lock(&self.state);
        out
    }
}

type LogicalPoolMap = HashMap<PoolId, LogicalPool>;
type PhysicalPoolMap = HashMap<PoolId, PhysicalPool>;
type ZoneMap = HashMap<ZoneId, Zone>;
type ServerMap = HashMap<ServerId, Server>;
type ChunkServerMap = HashMap<ChunkServerId, ChunkServerSlot>;
type CopySetMap = BTreeMap<CopySetKey, CopySetInfo>;

/// Entity counts, for logging and operator tooling.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TopologySummary {
    /// Live logical pools.
    pub logical_pools: usize,
    /// Live physical pools.
    pub physical_pools: usize,
    /// Live zones.
    pub zones: usize,
    /// Live servers.
    pub servers: usize,
    /// Live chunkservers.
    pub chunk_servers: usize,
    /// Live copysets.
    pub copysets: usize,
}

/// The cluster topology directory.
pub struct Topology {
    id_generator: Arc<dyn IdGenerator>,
    token_generator: Arc<dyn TokenGenerator>,
    storage: Arc<dyn TopologyStorage>,

    logical_pools: RwLock<LogicalPoolMap>,
    physical_pools: RwLock<PhysicalPoolMap>,
    zones: RwLock<ZoneMap>,
    servers: RwLock<ServerMap>,
    state_flush: Mutex<()>,
    chunk_servers: RwLock<ChunkServerMap>,
    copysets: RwLock<CopySetMap>,
}

// Validation shared by init, add and update. Each check skips the record's
// own id so an update may keep its current keys.

fn check_physical_pool(pools: &PhysicalPoolMap, data: &PhysicalPool) -> TopologyResult<()> {
    if pools
        .values()
        .any(|p| p.id != data.id && p.name == data.name)
    {
        return Err(TopologyError::already_exists(
            EntityKind::PhysicalPool,
            format!("name '{}'", data.name),
        ));
    }
    Ok(())
}

fn check_logical_pool(
    pools: &LogicalPoolMap,
    physical_pools: &PhysicalPoolMap,
    data: &LogicalPool,
) -> TopologyResult<()> {
    if !physical_pools.contains_key(&data.physical_pool_id) {
        return Err(TopologyError::invalid_reference(
            EntityKind::LogicalPool,
            data.id,
            EntityKind::PhysicalPool,
            data.physical_pool_id,
        ));
    }
    if pools.values().any(|p| {
        p.id != data.id && p.name == data.name && p.physical_pool_id == data.physical_pool_id
    }) {
        return Err(TopologyError::already_exists(
            EntityKind::LogicalPool,
            format!("name '{}' in physical pool {}", data.name, data.physical_pool_id),
        ));
    }
    Ok(())
}

fn check_zone(zones: &ZoneMap, physical_pools: &PhysicalPoolMap, data: &Zone) -> TopologyResult<()> {
    if !physical_pools.contains_key(&data.physical_pool_id) {
        return Err(TopologyError::invalid_reference(
            EntityKind::Zone,
            data.id,
            EntityKind::PhysicalPool,
            data.physical_pool_id,
        ));
    }
    if zones.values().any(|z| {
        z.id != data.id && z.name == data.name && z.physical_pool_id == data.physical_pool_id
    }) {
        return Err(TopologyError::already_exists(
            EntityKind::Zone,
            format!("name '{}' in physical pool {}", data.name, data.physical_pool_id),
        ));
    }
    Ok(())
}

fn check_server(servers: &ServerMap, zones: &ZoneMap, data: &Server) -> TopologyResult<()> {
    if !zones.contains_key(&data.zone_id) {
        return Err(TopologyError::invalid_reference(
            EntityKind::Server,
            data.id,
            EntityKind::Zone,
            data.zone_id,
        ));
    }
    for other in servers.values().filter(|s| s.id != data.id) {
        if other.hostname == data.hostname {
            return Err(TopologyError::already_exists(
                EntityKind::Server,
                format!("hostname '{}'", data.hostname),
            ));
        }
        let clash = [&data.internal_ip, &data.external_ip]
            .into_iter()
            .find(|ip| !ip.is_empty() && other.has_ip(ip));
        if let Some(ip) = clash {
            return Err(TopologyError::already_exists(
                EntityKind::Server,
                format!("ip '{}'", ip),
            ));
        }
    }
    Ok(())
}

fn check_chunk_server(
    chunk_servers: &ChunkServerMap,
    servers: &ServerMap,
    data: &ChunkServer,
) -> TopologyResult<()> {
    if !servers.contains_key(&data.server_id) {
        return Err(TopologyError::invalid_reference(
            EntityKind::ChunkServer,
            data.id,
            EntityKind::Server,
            data.server_id,
        ));
    }
    if chunk_servers
        .values()
        .any(|s| s.info.id != data.id && s.info.listens_on(&data.host_ip, data.port))
    {
        return Err(TopologyError::already_exists(
            EntityKind::ChunkServer,
            format!("{}:{}", data.host_ip, data.port),
        ));
    }
    Ok(())
}

fn check_copyset(
    logical_pools: &LogicalPoolMap,
    chunk_servers: &ChunkServerMap,
    data: &CopySetInfo,
) -> TopologyResult<()> {
    if !logical_pools.contains_key(&data.logical_pool_id) {
        return Err(TopologyError::invalid_reference(
            EntityKind::CopySet,
            data.key(),
            EntityKind::LogicalPool,
            data.logical_pool_id,
        ));
    }
    if let Some(missing) = data.members.iter().find(|m| !chunk_servers.contains_key(m)) {
        return Err(TopologyError::invalid_reference(
            EntityKind::CopySet,
            data.key(),
            EntityKind::ChunkServer,
            missing,
        ));
    }
    Ok(())
}

fn zones_in_physical_pool(zones: &ZoneMap, pool: PoolId) -> HashSet<ZoneId> {
    zones
        .values()
        .filter(|z| z.physical_pool_id == pool)
        .map(|z| z.id)
        .collect()
}

fn servers_in_zones(servers: &ServerMap, zones: &HashSet<ZoneId>) -> HashSet<ServerId> {
    servers
        .values()
        .filter(|s| zones.contains(&s.zone_id))
        .map(|s| s.id)
        .collect()
}

fn chunk_servers_on(chunk_servers: &ChunkServerMap, servers: &HashSet<ServerId>) -> Vec<ChunkServerId> {
    sorted(
        chunk_servers
            .values()
            .filter(|s| servers.contains(&s.info.server_id))
            .map(|s| s.info.id),
    )
}

fn sorted<T: Ord>(ids: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = ids.into_iter().collect();
    out.sort();
    out
}

fn max_id(ids: impl Iterator<Item = u32>) -> u32 {
    ids.max().unwrap_or(0)
}

impl Topology {
    /// Creates an empty directory. Call [`Topology::init`] before serving requests.
    pub fn new(
        id_generator: Arc<dyn IdGenerator>,
        token_generator: Arc<dyn TokenGenerator>,
        storage: Arc<dyn TopologyStorage>,
    ) -> Self {
        Self {
            id_generator,
            token_generator,
            storage,
            logical_pools: RwLock::new(HashMap::new()),
            physical_pools: RwLock::new(HashMap::new()),
            zones: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            state_flush: Mutex::new(()),
            chunk_servers: RwLock::new(HashMap::new()),
            copysets: RwLock::new(BTreeMap::new()),
        }
    }

    // ---------------------------------------------------------------------
    // init
    // ---------------------------------------------------------------------

    /// Replaces the in-memory maps with the persisted topology.
    ///
    /// Records are loaded parent-first and checked exactly as the add path
    /// would check them. On any failure the maps are left empty and
    /// [`TopologyError::Initialization`] is returned; the directory must not
    /// be used after that.
    pub fn init(&self) -> TopologyResult<()> {
        let mut logical_pools = write(&self.logical_pools);
        let mut physical_pools = write(&self.physical_pools);
        let mut zones = write(&self.zones);
        let mut servers = write(&self.servers);
        let _flush = lock(&self.state_flush);
        let mut chunk_servers = write(&self.chunk_servers);
        let mut copysets = write(&self.copysets);

        logical_pools.clear();
        physical_pools.clear();
        zones.clear();
        servers.clear();
        chunk_servers.clear();
        copysets.clear();

        let loaded = self
            .load_physical(
                &mut physical_pools,
                &mut zones,
                &mut servers,
                &mut chunk_servers,
            )
            .and_then(|()| {
                self.load_logical(
                    &mut logical_pools,
                    &physical_pools,
                    &chunk_servers,
                    &mut copysets,
                )
            });

        if let Err(e) = loaded {
            logical_pools.clear();
            physical_pools.clear();
            zones.clear();
            servers.clear();
            chunk_servers.clear();
            copysets.clear();
            tracing::error!(error = %e, "failed to load topology from storage");
            return Err(TopologyError::Initialization(e.to_string()));
        }

        let mut watermarks = IdWatermarks {
            logical_pool: max_id(logical_pools.keys().map(|id| id.as_u32())),
            physical_pool: max_id(physical_pools.keys().map(|id| id.as_u32())),
            zone: max_id(zones.keys().map(|id| id.as_u32())),
            server: max_id(servers.keys().map(|id| id.as_u32())),
            chunk_server: max_id(chunk_servers.keys().map(|id| id.as_u32())),
            ..Default::default()
        };
        for key in copysets.keys() {
            let max = watermarks.copysets.entry(key.logical_pool_id).or_insert(0);
            *max = (*max).max(key.copyset_id.as_u32());
        }
        self.id_generator.init(&watermarks);

        tracing::info!(
            logical_pools = logical_pools.len(),
            physical_pools = physical_pools.len(),
            zones = zones.len(),
            servers = servers.len(),
            chunk_servers = chunk_servers.len(),
            copysets = copysets.len(),
            "topology loaded"
        );
        Ok(())
    }

    fn load_physical(
        &self,
        physical_pools: &mut PhysicalPoolMap,
        zones: &mut ZoneMap,
        servers: &mut ServerMap,
        chunk_servers: &mut ChunkServerMap,
    ) -> TopologyResult<()> {
        for pool in self.storage.load_physical_pools()? {
            if physical_pools.contains_key(&pool.id) {
                return Err(TopologyError::already_exists(EntityKind::PhysicalPool, pool.id));
            }
            check_physical_pool(physical_pools, &pool)?;
            physical_pools.insert(pool.id, pool);
        }
        for zone in self.storage.load_zones()? {
            if zones.contains_key(&zone.id) {
                return Err(TopologyError::already_exists(EntityKind::Zone, zone.id));
            }
            check_zone(zones, physical_pools, &zone)?;
            zones.insert(zone.id, zone);
        }
        for server in self.storage.load_servers()? {
            if servers.contains_key(&server.id) {
                return Err(TopologyError::already_exists(EntityKind::Server, server.id));
            }
            check_server(servers, zones, &server)?;
            servers.insert(server.id, server);
        }
        for cs in self.storage.load_chunk_servers()? {
            if chunk_servers.contains_key(&cs.id) {
                return Err(TopologyError::already_exists(EntityKind::ChunkServer, cs.id));
            }
            check_chunk_server(chunk_servers, servers, &cs)?;
            chunk_servers.insert(cs.id, ChunkServerSlot::new(cs));
        }
        Ok(())
    }

    fn load_logical(
        &self,
        logical_pools: &mut LogicalPoolMap,
        physical_pools: &PhysicalPoolMap,
        chunk_servers: &ChunkServerMap,
        copysets: &mut CopySetMap,
    ) -> TopologyResult<()> {
        for pool in self.storage.load_logical_pools()? {
            if logical_pools.contains_key(&pool.id) {
                return Err(TopologyError::already_exists(EntityKind::LogicalPool, pool.id));
            }
            check_logical_pool(logical_pools, physical_pools, &pool)?;
            logical_pools.insert(pool.id, pool);
        }
        for cs in self.storage.load_copysets()? {
            if copysets.contains_key(&cs.key()) {
                return Err(TopologyError::already_exists(EntityKind::CopySet, cs.key()));
            }
            check_copyset(logical_pools, chunk_servers, &cs)?;
            copysets.insert(cs.key(), cs);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // allocate
    // ---------------------------------------------------------------------

    /// Allocates an id for a new logical pool.
    pub fn allocate_logical_pool_id(&self) -> PoolId {
        self.id_generator.gen_logical_pool_id()
    }

    /// Allocates an id for a new physical pool.
    pub fn allocate_physical_pool_id(&self) -> PoolId {
        self.id_generator.gen_physical_pool_id()
    }

    /// Allocates an id for a new zone.
    pub fn allocate_zone_id(&self) -> ZoneId {
        self.id_generator.gen_zone_id()
    }

    /// Allocates an id for a new server.
    pub fn allocate_server_id(&self) -> ServerId {
        self.id_generator.gen_server_id()
    }

    /// Allocates an id for a new chunkserver.
    pub fn allocate_chunk_server_id(&self) -> ChunkServerId {
        self.id_generator.gen_chunk_server_id()
    }

    /// Allocates a copyset id scoped to `logical_pool_id`.
    pub fn allocate_copyset_id(&self, logical_pool_id: PoolId) -> CopySetId {
        self.id_generator.gen_copyset_id(logical_pool_id)
    }

    /// Issues a token for a new chunkserver.
    pub fn allocate_token(&self) -> String {
        self.token_generator.gen_token()
    }

    // ---------------------------------------------------------------------
    // add
    // ---------------------------------------------------------------------

    /// Adds a logical pool backed by an existing physical pool.
    pub fn add_logical_pool(&self, data: &LogicalPool) -> TopologyResult<()> {
        let mut logical_pools = write(&self.logical_pools);
        let physical_pools = read(&self.physical_pools);

        if logical_pools.contains_key(&data.id) {
            return Err(TopologyError::already_exists(EntityKind::LogicalPool, data.id));
        }
        check_logical_pool(&logical_pools, &physical_pools, data)?;
        self.storage.insert_logical_pool(data).map_err(|e| {
            tracing::warn!(id = %data.id, error = %e, "failed to persist new logical pool");
            e
        })?;
        logical_pools.insert(data.id, data.clone());

        tracing::info!(id = %data.id, name = %data.name, physical_pool = %data.physical_pool_id, "added logical pool");
        Ok(())
    }

    /// Adds a physical pool.
    pub fn add_physical_pool(&self, data: &PhysicalPool) -> TopologyResult<()> {
        let mut physical_pools = write(&self.physical_pools);

        if physical_pools.contains_key(&data.id) {
            return Err(TopologyError::already_exists(EntityKind::PhysicalPool, data.id));
        }
        check_physical_pool(&physical_pools, data)?;
        self.storage.insert_physical_pool(data).map_err(|e| {
            tracing::warn!(id = %data.id, error = %e, "failed to persist new physical pool");
            e
        })?;
        physical_pools.insert(data.id, data.clone());

        tracing::info!(id = %data.id, name = %data.name, "added physical pool");
        Ok(())
    }

    /// Adds a zone to an existing physical pool.
    pub fn add_zone(&self, data: &Zone) -> TopologyResult<()> {
        let physical_pools = read(&self.physical_pools);
        let mut zones = write(&self.zones);

        if zones.contains_key(&data.id) {
            return Err(TopologyError::already_exists(EntityKind::Zone, data.id));
        }
        check_zone(&zones, &physical_pools, data)?;
        self.storage.insert_zone(data).map_err(|e| {
            tracing::warn!(id = %data.id, error = %e, "failed to persist new zone");
            e
        })?;
        zones.insert(data.id, data.clone());

        tracing::info!(id = %data.id, name = %data.name, physical_pool = %data.physical_pool_id, "added zone");
        Ok(())
    }

    /// Adds a server to an existing zone.
    pub fn add_server(&self, data: &Server) -> TopologyResult<()> {
        let zones = read(&self.zones);
        let mut servers = write(&self.servers);

        if servers.contains_key(&data.id) {
            return Err(TopologyError::already_exists(EntityKind::Server, data.id));
        }
        check_server(&servers, &zones, data)?;
        self.storage.insert_server(data).map_err(|e| {
            tracing::warn!(id = %data.id, error = %e, "failed to persist new server");
            e
        })?;
        servers.insert(data.id, data.clone());

        tracing::info!(id = %data.id, hostname = %data.hostname, zone = %data.zone_id, "added server");
        Ok(())
    }

    /// Adds a chunkserver to an existing server.
    pub fn add_chunk_server(&self, data: &ChunkServer) -> TopologyResult<()> {
        let servers = read(&self.servers);
        let mut chunk_servers = write(&self.chunk_servers);

        if chunk_servers.contains_key(&data.id) {
            return Err(TopologyError::already_exists(EntityKind::ChunkServer, data.id));
        }
        check_chunk_server(&chunk_servers, &servers, data)?;
        self.storage.insert_chunk_server(data).map_err(|e| {
            tracing::warn!(id = %data.id, error = %e, "failed to persist new chunkserver");
            e
        })?;
        chunk_servers.insert(data.id, ChunkServerSlot::new(data.clone()));

        tracing::info!(
            id = %data.id,
            addr = %format!("{}:{}", data.host_ip, data.port),
            server = %data.server_id,
            "added chunkserver"
        );
        Ok(())
    }

    /// Adds a copyset to an existing logical pool. Every member must be a
    /// live chunkserver.
    pub fn add_copyset(&self, data: &CopySetInfo) -> TopologyResult<()> {
        let logical_pools = read(&self.logical_pools);
        let chunk_servers = read(&self.chunk_servers);
        let mut copysets = write(&self.copysets);

        let key = data.key();
        if copysets.contains_key(&key) {
            return Err(TopologyError::already_exists(EntityKind::CopySet, key));
        }
        check_copyset(&logical_pools, &chunk_servers, data)?;
        self.storage.insert_copyset(data).map_err(|e| {
            tracing::warn!(key = %key, error = %e, "failed to persist new copyset");
            e
        })?;
        copysets.insert(key, data.clone());

        tracing::debug!(key = %key, members = data.members.len(), "added copyset");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // remove
    // ---------------------------------------------------------------------

    /// Removes a logical pool that has no copysets.
    pub fn remove_logical_pool(&self, id: PoolId) -> TopologyResult<()> {
        let mut logical_pools = write(&self.logical_pools);
        let copysets = read(&self.copysets);

        if !logical_pools.contains_key(&id) {
            return Err(TopologyError::not_found(EntityKind::LogicalPool, id));
        }
        if copysets.keys().any(|k| k.logical_pool_id == id) {
            return Err(TopologyError::has_dependents(EntityKind::LogicalPool, id));
        }
        self.storage.delete_logical_pool(id)?;
        logical_pools.remove(&id);

        tracing::info!(id = %id, "removed logical pool");
        Ok(())
    }

    /// Removes a physical pool that has no zones and backs no logical pool.
    pub fn remove_physical_pool(&self, id: PoolId) -> TopologyResult<()> {
        let logical_pools = read(&self.logical_pools);
        let mut physical_pools = write(&self.physical_pools);
        let zones = read(&self.zones);

        if !physical_pools.contains_key(&id) {
            return Err(TopologyError::not_found(EntityKind::PhysicalPool, id));
        }
        if zones.values().any(|z| z.physical_pool_id == id)
            || logical_pools.values().any(|p| p.physical_pool_id == id)
        {
            return Err(TopologyError::has_dependents(EntityKind::PhysicalPool, id));
        }
        self.storage.delete_physical_pool(id)?;
        physical_pools.remove(&id);

        tracing::info!(id = %id, "removed physical pool");
        Ok(())
    }

    /// Removes a zone that has no servers.
    pub fn remove_zone(&self, id: ZoneId) -> TopologyResult<()> {
        let mut zones = write(&self.zones);
        let servers = read(&self.servers);

        if !zones.contains_key(&id) {
            return Err(TopologyError::not_found(EntityKind::Zone, id));
        }
        if servers.values().any(|s| s.zone_id == id) {
            return Err(TopologyError::has_dependents(EntityKind::Zone, id));
        }
        self.storage.delete_zone(id)?;
        zones.remove(&id);

        tracing::info!(id = %id, "removed zone");
        Ok(())
    }

    /// Removes a server that hosts no chunkservers.
    pub fn remove_server(&self, id: ServerId) -> TopologyResult<()> {
        let mut servers = write(&self.servers);
        let chunk_servers = read(&self.chunk_servers);

        if !servers.contains_key(&id) {
            return Err(TopologyError::not_found(EntityKind::Server, id));
        }
        if chunk_servers.values().any(|s| s.info.server_id == id) {
            return Err(TopologyError::has_dependents(EntityKind::Server, id));
        }
        self.storage.delete_server(id)?;
        servers.remove(&id);

        tracing::info!(id = %id, "removed server");
        Ok(())
    }

    /// Removes a chunkserver that is not a member of any copyset.
    pub fn remove_chunk_server(&self, id: ChunkServerId) -> TopologyResult<()> {
        let _flush = lock(&self.state_flush);
        let mut chunk_servers = write(&self.chunk_servers);
        let copysets = read(&self.copysets);

        if !chunk_servers.contains_key(&id) {
            return Err(TopologyError::not_found(EntityKind::ChunkServer, id));
        }
        if copysets.values().any(|c| c.members.contains(&id)) {
            return Err(TopologyError::has_dependents(EntityKind::ChunkServer, id));
        }
        self.storage.delete_chunk_server(id)?;
        chunk_servers.remove(&id);

        tracing::info!(id = %id, "removed chunkserver");
        Ok(())
    }

    /// Removes a copyset.
    pub fn remove_copyset(&self, key: CopySetKey) -> TopologyResult<()> {
        let mut copysets = write(&self.copysets);

        if !copysets.contains_key(&key) {
            return Err(TopologyError::not_found(EntityKind::CopySet, key));
        }
        self.storage.delete_copyset(key)?;
        copysets.remove(&key);

        tracing::debug!(key = %key, "removed copyset");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // update
    // ---------------------------------------------------------------------

    /// Replaces a logical pool record.
    pub fn update_logical_pool(&self, data: &LogicalPool) -> TopologyResult<()> {
        let mut logical_pools = write(&self.logical_pools);
        let physical_pools = read(&self.physical_pools);

        if !logical_pools.contains_key(&data.id) {
            return Err(TopologyError::not_found(EntityKind::LogicalPool, data.id));
        }
        check_logical_pool(&logical_pools, &physical_pools, data)?;
        self.storage.update_logical_pool(data)?;
        logical_pools.insert(data.id, data.clone());

        tracing::debug!(id = %data.id, "updated logical pool");
        Ok(())
    }

    /// Replaces a physical pool record.
    pub fn update_physical_pool(&self, data: &PhysicalPool) -> TopologyResult<()> {
        let mut physical_pools = write(&self.physical_pools);

        if !physical_pools.contains_key(&data.id) {
            return Err(TopologyError::not_found(EntityKind::PhysicalPool, data.id));
        }
        check_physical_pool(&physical_pools, data)?;
        self.storage.update_physical_pool(data)?;
        physical_pools.insert(data.id, data.clone());

        tracing::debug!(id = %data.id, "updated physical pool");
        Ok(())
    }

    /// Replaces a zone record.
    pub fn update_zone(&self, data: &Zone) -> TopologyResult<()> {
        let physical_pools = read(&self.physical_pools);
        let mut zones = write(&self.zones);

        if !zones.contains_key(&data.id) {
            return Err(TopologyError::not_found(EntityKind::Zone, data.id));
        }
        check_zone(&zones, &physical_pools, data)?;
        self.storage.update_zone(data)?;
        zones.insert(data.id, data.clone());

        tracing::debug!(id = %data.id, "updated zone");
        Ok(())
    }

    /// Replaces a server record.
    pub fn update_server(&self, data: &Server) -> TopologyResult<()> {
        let zones = read(&self.zones);
        let mut servers = write(&self.servers);

        if !servers.contains_key(&data.id) {
            return Err(TopologyError::not_found(EntityKind::Server, data.id));
        }
        check_server(&servers, &zones, data)?;
        self.storage.update_server(data)?;
        servers.insert(data.id, data.clone());

        tracing::debug!(id = %data.id, "updated server");
        Ok(())
    }

    /// Replaces a chunkserver record, state included, and persists it.
    pub fn update_chunk_server(&self, data: &ChunkServer) -> TopologyResult<()> {
        let servers = read(&self.servers);
        let _flush = lock(&self.state_flush);
        let mut chunk_servers = write(&self.chunk_servers);

        if !chunk_servers.contains_key(&data.id) {
            return Err(TopologyError::not_found(EntityKind::ChunkServer, data.id));
        }
        check_chunk_server(&chunk_servers, &servers, data)?;
        self.storage.update_chunk_server(data)?;
        chunk_servers.insert(data.id, ChunkServerSlot::new(data.clone()));

        tracing::debug!(id = %data.id, "updated chunkserver");
        Ok(())
    }

    /// Replaces only the state of a chunkserver, in memory.
    ///
    /// Nothing is written to storage here; the record is marked for the next
    /// [`Topology::flush_chunk_server_states`].
    pub fn update_chunk_server_state(
        &self,
        state: &ChunkServerState,
        id: ChunkServerId,
    ) -> TopologyResult<()> {
        let chunk_servers = read(&self.chunk_servers);

        let slot = chunk_servers
            .get(&id)
            .ok_or_else(|| TopologyError::not_found(EntityKind::ChunkServer, id))?;
        *lock(&slot.state) = *state;
        slot.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Replaces a copyset record. Every member must be a live chunkserver.
    pub fn update_copyset(&self, data: &CopySetInfo) -> TopologyResult<()> {
        let logical_pools = read(&self.logical_pools);
        let chunk_servers = read(&self.chunk_servers);
        let mut copysets = write(&self.copysets);

        let key = data.key();
        if !copysets.contains_key(&key) {
            return Err(TopologyError::not_found(EntityKind::CopySet, key));
        }
        check_copyset(&logical_pools, &chunk_servers, data)?;
        self.storage.update_copyset(data)?;
        copysets.insert(key, data.clone());

        tracing::debug!(key = %key, epoch = data.epoch, "updated copyset");
        Ok(())
    }

    /// Persists every chunkserver whose state changed since it was last
    /// written and returns how many were written.
    ///
    /// A record whose write fails is marked again; the remaining records are
    /// still attempted and the first error is returned.
    ///
    /// Snapshots are taken under the chunkserver read lock, which is released
    /// before any storage write. Removes and full updates of chunkservers
    /// wait for the whole flush; state updates do not.
    pub fn flush_chunk_server_states(&self) -> TopologyResult<usize> {
        let _flush = lock(&self.state_flush);

        let pending: Vec<ChunkServer> = read(&self.chunk_servers)
            .values()
            .filter(|slot| slot.dirty.swap(false, Ordering::AcqRel))
            .map(ChunkServerSlot::snapshot)
            .collect();

        let mut flushed = 0;
        let mut first_error = None;
        let mut failed = Vec::new();
        for record in &pending {
            match self.storage.update_chunk_server(record) {
                Ok(()) => flushed += 1,
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "failed to flush chunkserver state");
                    failed.push(record.id);
                    first_error.get_or_insert(e);
                }
            }
        }

        if !failed.is_empty() {
            let chunk_servers = read(&self.chunk_servers);
            for id in &failed {
                if let Some(slot) = chunk_servers.get(id) {
                    slot.dirty.store(true, Ordering::Release);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                if flushed > 0 {
                    tracing::debug!(flushed, "flushed chunkserver states");
                }
                Ok(flushed)
            }
        }
    }

    // ---------------------------------------------------------------------
    // find
    // ---------------------------------------------------------------------

    /// Resolves a logical pool by its name and its physical pool's name.
    pub fn find_logical_pool(
        &self,
        logical_pool_name: &str,
        physical_pool_name: &str,
    ) -> Option<PoolId> {
        let logical_pools = read(&self.logical_pools);
        let physical_pools = read(&self.physical_pools);

        let physical_id = physical_pools
            .values()
            .find(|p| p.name == physical_pool_name)?
            .id;
        logical_pools
            .values()
            .find(|p| p.name == logical_pool_name && p.physical_pool_id == physical_id)
            .map(|p| p.id)
    }

    /// Resolves a physical pool by name.
    pub fn find_physical_pool(&self, physical_pool_name: &str) -> Option<PoolId> {
        read(&self.physical_pools)
            .values()
            .find(|p| p.name == physical_pool_name)
            .map(|p| p.id)
    }

    /// Resolves a zone by its name and its physical pool's name.
    pub fn find_zone(&self, zone_name: &str, physical_pool_name: &str) -> Option<ZoneId> {
        let physical_pools = read(&self.physical_pools);
        let zones = read(&self.zones);

        let physical_id = physical_pools
            .values()
            .find(|p| p.name == physical_pool_name)?
            .id;
        zones
            .values()
            .find(|z| z.name == zone_name && z.physical_pool_id == physical_id)
            .map(|z| z.id)
    }

    /// Resolves a zone by its name within a physical pool.
    pub fn find_zone_in_physical_pool(
        &self,
        zone_name: &str,
        physical_pool_id: PoolId,
    ) -> Option<ZoneId> {
        read(&self.zones)
            .values()
            .find(|z| z.name == zone_name && z.physical_pool_id == physical_pool_id)
            .map(|z| z.id)
    }

    /// Resolves a server by hostname.
    pub fn find_server_by_hostname(&self, hostname: &str) -> Option<ServerId> {
        read(&self.servers)
            .values()
            .find(|s| s.hostname == hostname)
            .map(|s| s.id)
    }

    /// Resolves a server by its internal or external address.
    pub fn find_server_by_host_ip(&self, host_ip: &str) -> Option<ServerId> {
        read(&self.servers)
            .values()
            .find(|s| s.has_ip(host_ip))
            .map(|s| s.id)
    }

    /// Resolves a chunkserver by listening address.
    pub fn find_chunk_server(&self, host_ip: &str, port: u32) -> Option<ChunkServerId> {
        read(&self.chunk_servers)
            .values()
            .find(|s| s.info.listens_on(host_ip, port))
            .map(|s| s.info.id)
    }

    // ---------------------------------------------------------------------
    // get
    // ---------------------------------------------------------------------

    /// Returns a copy of a logical pool.
    pub fn get_logical_pool(&self, id: PoolId) -> Option<LogicalPool> {
        read(&self.logical_pools).get(&id).cloned()
    }

    /// Returns a copy of a physical pool.
    pub fn get_physical_pool(&self, id: PoolId) -> Option<PhysicalPool> {
        read(&self.physical_pools).get(&id).cloned()
    }

    /// Returns a copy of a zone.
    pub fn get_zone(&self, id: ZoneId) -> Option<Zone> {
        read(&self.zones).get(&id).cloned()
    }

    /// Returns a copy of a server.
    pub fn get_server(&self, id: ServerId) -> Option<Server> {
        read(&self.servers).get(&id).cloned()
    }

    /// Returns a copy of a chunkserver with its current state.
    pub fn get_chunk_server(&self, id: ChunkServerId) -> Option<ChunkServer> {
        read(&self.chunk_servers).get(&id).map(ChunkServerSlot::snapshot)
    }

    /// Returns a copy of a copyset.
    pub fn get_copyset(&self, key: CopySetKey) -> Option<CopySetInfo> {
        read(&self.copysets).get(&key).cloned()
    }

    /// [`Topology::find_logical_pool`] followed by [`Topology::get_logical_pool`].
    pub fn get_logical_pool_by_name(
        &self,
        logical_pool_name: &str,
        physical_pool_name: &str,
    ) -> Option<LogicalPool> {
        self.find_logical_pool(logical_pool_name, physical_pool_name)
            .and_then(|id| self.get_logical_pool(id))
    }

    /// [`Topology::find_physical_pool`] followed by [`Topology::get_physical_pool`].
    pub fn get_physical_pool_by_name(&self, physical_pool_name: &str) -> Option<PhysicalPool> {
        self.find_physical_pool(physical_pool_name)
            .and_then(|id| self.get_physical_pool(id))
    }

    /// [`Topology::find_zone`] followed by [`Topology::get_zone`].
    pub fn get_zone_by_name(&self, zone_name: &str, physical_pool_name: &str) -> Option<Zone> {
        self.find_zone(zone_name, physical_pool_name)
            .and_then(|id| self.get_zone(id))
    }

    /// [`Topology::find_zone_in_physical_pool`] followed by [`Topology::get_zone`].
    pub fn get_zone_by_name_in_physical_pool(
        &self,
        zone_name: &str,
        physical_pool_id: PoolId,
    ) -> Option<Zone> {
        self.find_zone_in_physical_pool(zone_name, physical_pool_id)
            .and_then(|id| self.get_zone(id))
    }

    /// [`Topology::find_server_by_hostname`] followed by [`Topology::get_server`].
    pub fn get_server_by_hostname(&self, hostname: &str) -> Option<Server> {
        self.find_server_by_hostname(hostname)
            .and_then(|id| self.get_server(id))
    }

    /// [`Topology::find_server_by_host_ip`] followed by [`Topology::get_server`].
    pub fn get_server_by_host_ip(&self, host_ip: &str) -> Option<Server> {
        self.find_server_by_host_ip(host_ip)
            .and_then(|id| self.get_server(id))
    }

    /// [`Topology::find_chunk_server`] followed by [`Topology::get_chunk_server`].
    pub fn get_chunk_server_by_addr(&self, host_ip: &str, port: u32) -> Option<ChunkServer> {
        self.find_chunk_server(host_ip, port)
            .and_then(|id| self.get_chunk_server(id))
    }

    // ---------------------------------------------------------------------
    // list
    // ---------------------------------------------------------------------

    /// All chunkserver ids, ascending.
    pub fn chunk_servers_in_cluster(&self) -> Vec<ChunkServerId> {
        sorted(read(&self.chunk_servers).keys().copied())
    }

    /// All server ids, ascending.
    pub fn servers_in_cluster(&self) -> Vec<ServerId> {
        sorted(read(&self.servers).keys().copied())
    }

    /// All zone ids, ascending.
    pub fn zones_in_cluster(&self) -> Vec<ZoneId> {
        sorted(read(&self.zones).keys().copied())
    }

    /// All physical pool ids, ascending.
    pub fn physical_pools_in_cluster(&self) -> Vec<PoolId> {
        sorted(read(&self.physical_pools).keys().copied())
    }

    /// All logical pool ids, ascending.
    pub fn logical_pools_in_cluster(&self) -> Vec<PoolId> {
        sorted(read(&self.logical_pools).keys().copied())
    }

    /// All copyset keys, ascending.
    pub fn copysets_in_cluster(&self) -> Vec<CopySetKey> {
        read(&self.copysets).keys().copied().collect()
    }

    /// Chunkservers hosted on a server.
    pub fn chunk_servers_in_server(&self, id: ServerId) -> Vec<ChunkServerId> {
        let chunk_servers = read(&self.chunk_servers);
        sorted(
            chunk_servers
                .values()
                .filter(|s| s.info.server_id == id)
                .map(|s| s.info.id),
        )
    }

    /// Chunkservers on servers in a zone.
    pub fn chunk_servers_in_zone(&self, id: ZoneId) -> Vec<ChunkServerId> {
        let servers = read(&self.servers);
        let chunk_servers = read(&self.chunk_servers);

        let zone: HashSet<ZoneId> = [id].into_iter().collect();
        chunk_servers_on(&chunk_servers, &servers_in_zones(&servers, &zone))
    }

    /// Chunkservers on servers in any zone of a physical pool.
    pub fn chunk_servers_in_physical_pool(&self, id: PoolId) -> Vec<ChunkServerId> {
        let zones = read(&self.zones);
        let servers = read(&self.servers);
        let chunk_servers = read(&self.chunk_servers);

        let zone_ids = zones_in_physical_pool(&zones, id);
        chunk_servers_on(&chunk_servers, &servers_in_zones(&servers, &zone_ids))
    }

    /// Servers in a zone.
    pub fn servers_in_zone(&self, id: ZoneId) -> Vec<ServerId> {
        let servers = read(&self.servers);
        sorted(servers.values().filter(|s| s.zone_id == id).map(|s| s.id))
    }

    /// Servers in any zone of a physical pool.
    pub fn servers_in_physical_pool(&self, id: PoolId) -> Vec<ServerId> {
        let zones = read(&self.zones);
        let servers = read(&self.servers);

        sorted(servers_in_zones(&servers, &zones_in_physical_pool(&zones, id)))
    }

    /// Zones in a physical pool.
    pub fn zones_in_physical_pool(&self, id: PoolId) -> Vec<ZoneId> {
        sorted(zones_in_physical_pool(&read(&self.zones), id))
    }

    /// Logical pools backed by a physical pool.
    pub fn logical_pools_in_physical_pool(&self, id: PoolId) -> Vec<PoolId> {
        let logical_pools = read(&self.logical_pools);
        sorted(
            logical_pools
                .values()
                .filter(|p| p.physical_pool_id == id)
                .map(|p| p.id),
        )
    }

    /// Chunkservers in the physical pool backing a logical pool.
    pub fn chunk_servers_in_logical_pool(&self, id: PoolId) -> Vec<ChunkServerId> {
        let logical_pools = read(&self.logical_pools);
        let zones = read(&self.zones);
        let servers = read(&self.servers);
        let chunk_servers = read(&self.chunk_servers);

        match logical_pools.get(&id) {
            Some(pool) => {
                let zone_ids = zones_in_physical_pool(&zones, pool.physical_pool_id);
                chunk_servers_on(&chunk_servers, &servers_in_zones(&servers, &zone_ids))
            }
            None => Vec::new(),
        }
    }

    /// Servers in the physical pool backing a logical pool.
    pub fn servers_in_logical_pool(&self, id: PoolId) -> Vec<ServerId> {
        let logical_pools = read(&self.logical_pools);
        let zones = read(&self.zones);
        let servers = read(&self.servers);

        match logical_pools.get(&id) {
            Some(pool) => sorted(servers_in_zones(
                &servers,
                &zones_in_physical_pool(&zones, pool.physical_pool_id),
            )),
            None => Vec::new(),
        }
    }

    /// Zones in the physical pool backing a logical pool.
    pub fn zones_in_logical_pool(&self, id: PoolId) -> Vec<ZoneId> {
        let logical_pools = read(&self.logical_pools);
        let zones = read(&self.zones);

        match logical_pools.get(&id) {
            Some(pool) => sorted(zones_in_physical_pool(&zones, pool.physical_pool_id)),
            None => Vec::new(),
        }
    }

    /// Copyset ids of a logical pool, ascending.
    pub fn copysets_in_logical_pool(&self, logical_pool_id: PoolId) -> Vec<CopySetId> {
        let copysets = read(&self.copysets);
        let start = CopySetKey::new(logical_pool_id, CopySetId::new(0));
        let end = CopySetKey::new(logical_pool_id, CopySetId::new(u32::MAX));
        copysets
            .range(start..=end)
            .map(|(key, _)| key.copyset_id)
            .collect()
    }

    /// Copysets that list a chunkserver as a member.
    pub fn copysets_on_chunk_server(&self, id: ChunkServerId) -> Vec<CopySetKey> {
        read(&self.copysets)
            .values()
            .filter(|c| c.members.contains(&id))
            .map(|c| c.key())
            .collect()
    }

    /// Number of live entities of each kind.
    pub fn summary(&self) -> TopologySummary {
        let logical_pools = read(&self.logical_pools);
        let physical_pools = read(&self.physical_pools);
        let zones = read(&self.zones);
        let servers = read(&self.servers);
        let chunk_servers = read(&self.chunk_servers);
        let copysets = read(&self.copysets);

        TopologySummary {
            logical_pools: logical_pools.len(),
            physical_pools: physical_pools.len(),
            zones: zones.len(),
            servers: servers.len(),
            chunk_servers: chunk_servers.len(),
            copysets: copysets.len(),
        }
    }
}
