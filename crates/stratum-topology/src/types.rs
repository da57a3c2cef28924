//! Identifier and record types for the topology directory.
//!
//! Every record handed out by the directory is an owned copy; nothing in this
//! module borrows from the directory's maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a logical or physical pool.
///
/// Logical and physical pools draw from separate id sequences but share the type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(u32);

impl PoolId {
    /// Never handed out by an allocator.
    pub const UNINITIALIZED: PoolId = PoolId(0);

    /// Creates a new PoolId from a raw u32 value
    pub fn new(id: u32) -> Self {
        PoolId(id)
    }

    /// Returns the raw u32 value of this pool ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a zone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(u32);

impl ZoneId {
    /// Never handed out by an allocator.
    pub const UNINITIALIZED: ZoneId = ZoneId(0);

    /// Creates a new ZoneId from a raw u32 value
    pub fn new(id: u32) -> Self {
        ZoneId(id)
    }

    /// Returns the raw u32 value of this zone ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a physical host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(u32);

impl ServerId {
    /// Never handed out by an allocator.
    pub const UNINITIALIZED: ServerId = ServerId(0);

    /// Creates a new ServerId from a raw u32 value
    pub fn new(id: u32) -> Self {
        ServerId(id)
    }

    /// Returns the raw u32 value of this server ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chunkserver process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkServerId(u32);

impl ChunkServerId {
    /// Never handed out by an allocator.
    pub const UNINITIALIZED: ChunkServerId = ChunkServerId(0);

    /// Creates a new ChunkServerId from a raw u32 value
    pub fn new(id: u32) -> Self {
        ChunkServerId(id)
    }

    /// Returns the raw u32 value of this chunkserver ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChunkServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a copyset, unique only within its logical pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CopySetId(u32);

impl CopySetId {
    /// Never handed out by an allocator.
    pub const UNINITIALIZED: CopySetId = CopySetId(0);

    /// Creates a new CopySetId from a raw u32 value
    pub fn new(id: u32) -> Self {
        CopySetId(id)
    }

    /// Returns the raw u32 value of this copyset ID
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CopySetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite key of a copyset. Orders by logical pool first, so all copysets
/// of one pool are contiguous in an ordered map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CopySetKey {
    /// Owning logical pool.
    pub logical_pool_id: PoolId,
    /// Copyset id within the pool.
    pub copyset_id: CopySetId,
}

impl CopySetKey {
    /// Creates a key from its two parts.
    pub fn new(logical_pool_id: PoolId, copyset_id: CopySetId) -> Self {
        Self {
            logical_pool_id,
            copyset_id,
        }
    }
}

impl fmt::Display for CopySetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.logical_pool_id, self.copyset_id)
    }
}

/// Top-level grouping of physical hardware.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPool {
    /// Pool identifier.
    pub id: PoolId,
    /// Cluster-wide unique name.
    pub name: String,
    /// Free-form description.
    pub desc: String,
}

impl PhysicalPool {
    /// Creates a physical pool record.
    pub fn new(id: PoolId, name: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            desc: desc.into(),
        }
    }
}

/// Fault-isolation domain inside a physical pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Zone identifier.
    pub id: ZoneId,
    /// Name, unique within the physical pool.
    pub name: String,
    /// Owning physical pool.
    pub physical_pool_id: PoolId,
    /// Free-form description.
    pub desc: String,
}

impl Zone {
    /// Creates a zone record.
    pub fn new(
        id: ZoneId,
        name: impl Into<String>,
        physical_pool_id: PoolId,
        desc: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            physical_pool_id,
            desc: desc.into(),
        }
    }
}

/// A physical host belonging to one zone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Server identifier.
    pub id: ServerId,
    /// Cluster-wide unique hostname.
    pub hostname: String,
    /// Cluster-wide unique internal address.
    pub internal_ip: String,
    /// Internal service port.
    pub internal_port: u32,
    /// External address, may be empty.
    pub external_ip: String,
    /// External service port.
    pub external_port: u32,
    /// Owning zone.
    pub zone_id: ZoneId,
    /// Free-form description.
    pub desc: String,
}

impl Server {
    /// True if either of the server's addresses equals `ip`.
    pub fn has_ip(&self, ip: &str) -> bool {
        self.internal_ip == ip || (!self.external_ip.is_empty() && self.external_ip == ip)
    }
}

/// Health of a chunkserver as last reported.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkServerStatus {
    /// Serving requests.
    Online,
    /// Not reachable.
    Offline,
    /// Permanently taken out of service.
    Retired,
}

/// Health of a chunkserver's data disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskState {
    /// Disk is usable.
    Normal,
    /// Disk reported an error.
    Error,
}

/// Frequently mutated part of a chunkserver record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkServerState {
    /// Process health.
    pub status: ChunkServerStatus,
    /// Disk health.
    pub disk_state: DiskState,
    /// Disk capacity in bytes.
    pub disk_capacity: u64,
    /// Bytes used on disk.
    pub disk_used: u64,
}

impl Default for ChunkServerState {
    fn default() -> Self {
        Self {
            status: ChunkServerStatus::Offline,
            disk_state: DiskState::Normal,
            disk_capacity: 0,
            disk_used: 0,
        }
    }
}

/// A storage process running on a server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkServer {
    /// Chunkserver identifier.
    pub id: ChunkServerId,
    /// Opaque credential issued at creation.
    pub token: String,
    /// Disk technology label, e.g. "ssd".
    pub disk_type: String,
    /// Hosting server.
    pub server_id: ServerId,
    /// Listening address; with `port` unique cluster-wide.
    pub host_ip: String,
    /// Listening port.
    pub port: u32,
    /// Data directory on the host.
    pub mount_point: String,
    /// Health and usage.
    pub state: ChunkServerState,
}

impl ChunkServer {
    /// True if the chunkserver listens on `ip:port`.
    pub fn listens_on(&self, ip: &str, port: u32) -> bool {
        self.host_ip == ip && self.port == port
    }
}

/// Data layout of a logical pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalPoolType {
    /// Fixed-size page files.
    PageFile,
    /// Append-only files.
    AppendFile,
}

/// Whether new volumes may be placed in a logical pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalPoolStatus {
    /// Accepts new allocations.
    Allocatable,
    /// Closed for new allocations.
    Unallocatable,
}

/// Redundancy and placement parameters of a logical pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPolicy {
    /// Replicas per copyset.
    pub replica_num: u32,
    /// Number of copysets to create.
    pub copyset_num: u32,
    /// Number of zones replicas are spread across.
    pub zone_num: u32,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            replica_num: 3,
            copyset_num: 100,
            zone_num: 3,
        }
    }
}

/// A named storage pool exposed to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPool {
    /// Pool identifier.
    pub id: PoolId,
    /// Name, unique within the physical pool.
    pub name: String,
    /// Backing physical pool.
    pub physical_pool_id: PoolId,
    /// Data layout.
    pub pool_type: LogicalPoolType,
    /// Redundancy and placement parameters.
    pub policy: PoolPolicy,
    /// Creation time, seconds since the Unix epoch.
    pub create_time: u64,
    /// Allocation status.
    pub status: LogicalPoolStatus,
}

/// A replication group of chunkservers within a logical pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySetInfo {
    /// Owning logical pool.
    pub logical_pool_id: PoolId,
    /// Id within the pool.
    pub copyset_id: CopySetId,
    /// Configuration epoch.
    pub epoch: u64,
    /// Replica chunkservers.
    pub members: BTreeSet<ChunkServerId>,
}

impl CopySetInfo {
    /// Creates a copyset with no members at epoch 0.
    pub fn new(logical_pool_id: PoolId, copyset_id: CopySetId) -> Self {
        Self {
            logical_pool_id,
            copyset_id,
            epoch: 0,
            members: BTreeSet::new(),
        }
    }

    /// Composite key of this copyset.
    pub fn key(&self) -> CopySetKey {
        CopySetKey::new(self.logical_pool_id, self.copyset_id)
    }
}
