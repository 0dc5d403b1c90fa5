//! Key to partition to node resolution.
//!
//! Pure functions over an immutable [`TopologyTable`]: no I/O, no caching,
//! nothing to lock. The hash is the CRC32 scheme the cluster itself uses, so
//! every client in a deployment agrees on where a key lives.

use crate::{
    error::RoutingError,
    topology::{NodeId, TopologyTable},
};

/// Where a key should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub partition: u16,
    pub node: NodeId,
}

/// Partition index for `key`. Returns 0 when `partition_count` is 0; the
/// lookup that follows fails in that case.
pub fn partition_for_key(key: &[u8], partition_count: usize) -> u16 {
    if partition_count == 0 {
        return 0;
    }
    let crc = crc32fast::hash(key);
    let digest = (crc >> 16) & 0x7fff;
    (digest as usize % partition_count) as u16
}

pub fn resolve(
    key: &[u8],
    table: &TopologyTable,
    use_forward_map: bool,
) -> Result<Route, RoutingError> {
    let partition = partition_for_key(key, table.partition_count());
    resolve_partition(partition, table, use_forward_map)
}

/// Resolves an already-hashed partition. The forward map wins when asked
/// for and it has an entry; otherwise the current map decides.
pub fn resolve_partition(
    partition: u16,
    table: &TopologyTable,
    use_forward_map: bool,
) -> Result<Route, RoutingError> {
    let forward = use_forward_map
        .then(|| table.forward_owner(partition))
        .flatten();
    let node = forward
        .or_else(|| table.owner(partition))
        .ok_or(RoutingError { partition })?;

    Ok(Route {
        partition,
        node: node.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn four_partitions() -> TopologyTable {
        let a = NodeId::new("a:1");
        let b = NodeId::new("b:1");
        TopologyTable::from_owners(1, &[a.clone(), a, b.clone(), b])
    }

    #[test]
    fn resolve_is_deterministic() {
        let table = four_partitions();
        for key in ["alpha", "beta", "gamma", "delta", ""] {
            let first = resolve(key.as_bytes(), &table, false).expect("route");
            for _ in 0..16 {
                assert_eq!(resolve(key.as_bytes(), &table, false), Ok(first.clone()));
            }
        }
    }

    #[test]
    fn crc_partitioning_matches_cluster_scheme() {
        // crc32("foo") = 0x8c736521 -> (0x8c73 & 0x7fff) = 3187.
        assert_eq!(partition_for_key(b"foo", 4), 3);
        assert_eq!(partition_for_key(b"foo", 1024), (3187 % 1024) as u16);
        assert_eq!(partition_for_key(b"foo", 0), 0);
    }

    #[test]
    fn forward_map_wins_only_when_requested() {
        let a = NodeId::new("a:1");
        let b = NodeId::new("b:1");
        let table = TopologyTable::from_owners(1, &[a.clone(), a.clone()])
            .with_forward_owners(&[b.clone()]);

        assert_eq!(resolve_partition(0, &table, false).map(|r| r.node), Ok(a.clone()));
        assert_eq!(resolve_partition(0, &table, true).map(|r| r.node), Ok(b));
        // No forward entry for partition 1: fall back to the current owner.
        assert_eq!(resolve_partition(1, &table, true).map(|r| r.node), Ok(a));
    }

    #[test]
    fn missing_owner_is_a_routing_error() {
        assert_eq!(
            resolve(b"anything", &TopologyTable::empty(), false),
            Err(RoutingError { partition: 0 })
        );
    }
}
