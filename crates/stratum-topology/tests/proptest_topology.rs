//! Property-based tests for the topology directory using proptest.
//!
//! Random operation sequences are applied to a fresh directory; whatever the
//! directory accepts or rejects, parent references must resolve and natural
//! keys must stay unique after every step.

mod common;

use std::collections::HashSet;

use common::{chunk_server, logical_pool, memory_topology, server};
use proptest::prelude::*;
use stratum_topology::{
    ChunkServerId, CopySetId, CopySetInfo, CopySetKey, PhysicalPool, PoolId, ServerId, Topology,
    TopologyError, Zone, ZoneId,
};

#[derive(Clone, Debug)]
enum Op {
    AddPhysicalPool { name: u8 },
    AddZone { pool: u32, name: u8 },
    AddServer { zone: u32, host: u8, ip: u8 },
    AddChunkServer { server: u32, ip: u8, port: u8 },
    AddLogicalPool { pool: u32, name: u8 },
    AddCopySet { pool: u32, members: Vec<u32> },
    RemovePhysicalPool(u32),
    RemoveZone(u32),
    RemoveServer(u32),
    RemoveChunkServer(u32),
    RemoveLogicalPool(u32),
    RemoveCopySet { pool: u32, copyset: u32 },
}

/// Small id and name ranges so collisions and dangling references are common.
fn any_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(|name| Op::AddPhysicalPool { name }),
        (0u32..6, 0u8..3).prop_map(|(pool, name)| Op::AddZone { pool, name }),
        (0u32..8, 0u8..6, 0u8..6).prop_map(|(zone, host, ip)| Op::AddServer { zone, host, ip }),
        (0u32..8, 0u8..6, 0u8..3).prop_map(|(server, ip, port)| Op::AddChunkServer {
            server,
            ip,
            port
        }),
        (0u32..6, 0u8..3).prop_map(|(pool, name)| Op::AddLogicalPool { pool, name }),
        (0u32..6, proptest::collection::vec(0u32..12, 0..4))
            .prop_map(|(pool, members)| Op::AddCopySet { pool, members }),
        (0u32..6).prop_map(Op::RemovePhysicalPool),
        (0u32..8).prop_map(Op::RemoveZone),
        (0u32..8).prop_map(Op::RemoveServer),
        (0u32..12).prop_map(Op::RemoveChunkServer),
        (0u32..6).prop_map(Op::RemoveLogicalPool),
        (0u32..6, 0u32..8).prop_map(|(pool, copyset)| Op::RemoveCopySet { pool, copyset }),
    ]
}

fn apply(topo: &Topology, op: &Op) -> Result<(), TopologyError> {
    match op {
        Op::AddPhysicalPool { name } => {
            let id = topo.allocate_physical_pool_id();
            topo.add_physical_pool(&PhysicalPool::new(id, format!("pp{}", name), ""))
        }
        Op::AddZone { pool, name } => {
            let id = topo.allocate_zone_id();
            topo.add_zone(&Zone::new(id, format!("z{}", name), PoolId::new(*pool), ""))
        }
        Op::AddServer { zone, host, ip } => {
            let id = topo.allocate_server_id();
            topo.add_server(&server(
                id,
                ZoneId::new(*zone),
                &format!("host{}", host),
                &format!("10.0.0.{}", ip),
            ))
        }
        Op::AddChunkServer { server, ip, port } => {
            let id = topo.allocate_chunk_server_id();
            topo.add_chunk_server(&chunk_server(
                id,
                ServerId::new(*server),
                &topo.allocate_token(),
                &format!("10.0.0.{}", ip),
                8200 + u32::from(*port),
            ))
        }
        Op::AddLogicalPool { pool, name } => {
            let id = topo.allocate_logical_pool_id();
            topo.add_logical_pool(&logical_pool(id, &format!("lp{}", name), PoolId::new(*pool)))
        }
        Op::AddCopySet { pool, members } => {
            let pool = PoolId::new(*pool);
            let mut info = CopySetInfo::new(pool, topo.allocate_copyset_id(pool));
            info.members = members.iter().map(|m| ChunkServerId::new(*m)).collect();
            topo.add_copyset(&info)
        }
        Op::RemovePhysicalPool(id) => topo.remove_physical_pool(PoolId::new(*id)),
        Op::RemoveZone(id) => topo.remove_zone(ZoneId::new(*id)),
        Op::RemoveServer(id) => topo.remove_server(ServerId::new(*id)),
        Op::RemoveChunkServer(id) => topo.remove_chunk_server(ChunkServerId::new(*id)),
        Op::RemoveLogicalPool(id) => topo.remove_logical_pool(PoolId::new(*id)),
        Op::RemoveCopySet { pool, copyset } => topo.remove_copyset(CopySetKey::new(
            PoolId::new(*pool),
            CopySetId::new(*copyset),
        )),
    }
}

fn check_invariants(topo: &Topology) -> Result<(), TestCaseError> {
    let mut pool_names = HashSet::new();
    for id in topo.physical_pools_in_cluster() {
        let pool = topo.get_physical_pool(id).unwrap();
        prop_assert!(pool_names.insert(pool.name));
    }

    let mut zone_keys = HashSet::new();
    for id in topo.zones_in_cluster() {
        let zone = topo.get_zone(id).unwrap();
        prop_assert!(topo.get_physical_pool(zone.physical_pool_id).is_some());
        prop_assert!(zone_keys.insert((zone.name, zone.physical_pool_id)));
    }

    let mut hostnames = HashSet::new();
    let mut ips = HashSet::new();
    for id in topo.servers_in_cluster() {
        let server = topo.get_server(id).unwrap();
        prop_assert!(topo.get_zone(server.zone_id).is_some());
        prop_assert!(hostnames.insert(server.hostname));
        prop_assert!(ips.insert(server.internal_ip));
    }

    let mut addrs = HashSet::new();
    for id in topo.chunk_servers_in_cluster() {
        let cs = topo.get_chunk_server(id).unwrap();
        prop_assert!(topo.get_server(cs.server_id).is_some());
        prop_assert!(addrs.insert((cs.host_ip, cs.port)));
    }

    let mut lp_keys = HashSet::new();
    for id in topo.logical_pools_in_cluster() {
        let lp = topo.get_logical_pool(id).unwrap();
        prop_assert!(topo.get_physical_pool(lp.physical_pool_id).is_some());
        prop_assert!(lp_keys.insert((lp.name, lp.physical_pool_id)));
    }

    for key in topo.copysets_in_cluster() {
        let cs = topo.get_copyset(key).unwrap();
        prop_assert!(topo.get_logical_pool(cs.logical_pool_id).is_some());
        for member in &cs.members {
            prop_assert!(topo.get_chunk_server(*member).is_some());
        }
    }
    Ok(())
}

proptest! {
    /// Whatever sequence is applied, references resolve and keys stay unique.
    #[test]
    fn test_random_sequences_keep_directory_consistent(
        ops in proptest::collection::vec(any_op(), 1..80),
    ) {
        let topo = memory_topology();
        for op in &ops {
            let _ = apply(&topo, op);
            check_invariants(&topo)?;
        }
    }

    /// A rejected call leaves the directory exactly as it was.
    #[test]
    fn test_rejected_ops_change_nothing(
        ops in proptest::collection::vec(any_op(), 1..60),
    ) {
        let topo = memory_topology();
        for op in &ops {
            let before = topo.summary();
            if apply(&topo, op).is_err() {
                prop_assert_eq!(topo.summary(), before);
            }
        }
    }

    /// Every accepted server add reads back unchanged.
    #[test]
    fn test_server_add_get_round_trip(host in "[a-z]{1,12}", last in 1u8..255, port in 1u32..65535) {
        let topo = memory_topology();
        let p = topo.allocate_physical_pool_id();
        topo.add_physical_pool(&PhysicalPool::new(p, "p", "")).unwrap();
        let z = topo.allocate_zone_id();
        topo.add_zone(&Zone::new(z, "z", p, "")).unwrap();

        let mut s = server(topo.allocate_server_id(), z, &host, &format!("172.16.0.{}", last));
        s.internal_port = port;
        topo.add_server(&s).unwrap();
        prop_assert_eq!(topo.get_server(s.id), Some(s.clone()));
        prop_assert_eq!(topo.find_server_by_hostname(&host), Some(s.id));
    }
}
