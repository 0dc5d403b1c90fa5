//! Partition tables.
//!
//! A [`TopologyTable`] is an immutable snapshot of which node owns each
//! partition, plus the forward map a cluster publishes while a rebalance is
//! moving partitions. Tables are shared as `Arc<TopologyTable>` and replaced
//! wholesale, never edited.
//!
//! Tables are built from the cluster's bucket configuration document:
//!
//! ```json
//! {
//!   "name": "default",
//!   "rev": 12,
//!   "vBucketServerMap": {
//!     "hashAlgorithm": "CRC",
//!     "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
//!     "vBucketMap": [[0], [0], [1], [1]],
//!     "vBucketMapForward": [[0], [1], [1], [1]]
//!   }
//! }
//! ```
//!
//! The first entry of each map row is the active owner's index into
//! `serverList`; `-1` means the partition currently has no owner.

use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Address of a cluster node, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default)]
    pub rev: u64,
    #[serde(rename = "vBucketServerMap")]
    pub server_map: ServerMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerMap {
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    #[serde(default)]
    pub num_replicas: u32,
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
    #[serde(
        rename = "vBucketMapForward",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub vbucket_map_forward: Option<Vec<Vec<i32>>>,
}

fn default_hash_algorithm() -> String {
    "CRC".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyTable {
    revision: u64,
    nodes: Vec<NodeId>,
    current: Vec<Option<usize>>,
    forward: Option<Vec<Option<usize>>>,
}

impl TopologyTable {
    /// A table with no partitions. Nothing routes against it.
    pub fn empty() -> Self {
        Self {
            revision: 0,
            nodes: Vec::new(),
            current: Vec::new(),
            forward: None,
        }
    }

    pub fn new(
        revision: u64,
        nodes: Vec<NodeId>,
        current: Vec<Option<usize>>,
        forward: Option<Vec<Option<usize>>>,
    ) -> Result<Self, TopologyError> {
        if current.len() > usize::from(u16::MAX) + 1 {
            return Err(TopologyError::Malformed(format!(
                "{} partitions exceeds the partition id space",
                current.len()
            )));
        }
        let in_range = |owner: &Option<usize>| owner.is_none_or(|idx| idx < nodes.len());
        if !current.iter().all(in_range) {
            return Err(TopologyError::Malformed(
                "partition map references an unknown server".to_string(),
            ));
        }
        if let Some(forward) = &forward {
            if forward.len() != current.len() {
                return Err(TopologyError::Malformed(format!(
                    "forward map has {} partitions, current map has {}",
                    forward.len(),
                    current.len()
                )));
            }
            if !forward.iter().all(in_range) {
                return Err(TopologyError::Malformed(
                    "forward map references an unknown server".to_string(),
                ));
            }
        }

        Ok(Self {
            revision,
            nodes,
            current,
            forward,
        })
    }

    /// Builds a table where partition `i` is owned by `owners[i]`.
    pub fn from_owners(revision: u64, owners: &[NodeId]) -> Self {
        let mut nodes = Vec::new();
        let current = owners
            .iter()
            .map(|owner| Some(index_of(&mut nodes, owner)))
            .collect();
        Self {
            revision,
            nodes,
            current,
            forward: None,
        }
    }

    /// Adds a forward map; partition `i` is headed to `owners[i]`.
    /// Partitions beyond `owners.len()` get no forward entry.
    pub fn with_forward_owners(mut self, owners: &[NodeId]) -> Self {
        let forward = (0..self.current.len())
            .map(|partition| {
                owners
                    .get(partition)
                    .map(|owner| index_of(&mut self.nodes, owner))
            })
            .collect();
        self.forward = Some(forward);
        self
    }

    pub fn from_bucket_config(config: &BucketConfig) -> Result<Self, TopologyError> {
        let map = &config.server_map;
        if !map.hash_algorithm.eq_ignore_ascii_case("CRC") {
            return Err(TopologyError::Malformed(format!(
                "unsupported hash algorithm {}",
                map.hash_algorithm
            )));
        }

        let nodes = map.server_list.iter().map(|s| NodeId::new(s.as_str())).collect();
        let current = parse_map(&map.vbucket_map)?;
        let forward = map
            .vbucket_map_forward
            .as_deref()
            .filter(|rows| !rows.is_empty())
            .map(parse_map)
            .transpose()?;

        Self::new(config.rev, nodes, current, forward)
    }

    pub fn parse(json: &str) -> Result<Self, TopologyError> {
        let config: BucketConfig = serde_json::from_str(json)
            .map_err(|err| TopologyError::Malformed(err.to_string()))?;
        Self::from_bucket_config(&config)
    }

    pub fn to_bucket_config(&self, bucket: &str) -> BucketConfig {
        BucketConfig {
            name: bucket.to_string(),
            rev: self.revision,
            server_map: ServerMap {
                hash_algorithm: default_hash_algorithm(),
                num_replicas: 0,
                server_list: self.nodes.iter().map(|n| n.to_string()).collect(),
                vbucket_map: render_map(&self.current),
                vbucket_map_forward: self.forward.as_deref().map(render_map),
            },
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn partition_count(&self) -> usize {
        self.current.len()
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn owner(&self, partition: u16) -> Option<&NodeId> {
        lookup(&self.nodes, &self.current, partition)
    }

    pub fn forward_owner(&self, partition: u16) -> Option<&NodeId> {
        self.forward
            .as_deref()
            .and_then(|forward| lookup(&self.nodes, forward, partition))
    }

    pub fn has_forward_map(&self) -> bool {
        self.forward.is_some()
    }

    /// Every partition has an owner in the current map.
    pub fn is_ready(&self) -> bool {
        !self.current.is_empty() && self.current.iter().all(Option::is_some)
    }

    /// Partitions currently owned by `node`.
    pub fn partitions_of(&self, node: &NodeId) -> Vec<u16> {
        let Some(idx) = self.nodes.iter().position(|n| n == node) else {
            return Vec::new();
        };
        self.current
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(idx))
            .map(|(partition, _)| partition as u16)
            .collect()
    }
}

fn index_of(nodes: &mut Vec<NodeId>, node: &NodeId) -> usize {
    match nodes.iter().position(|n| n == node) {
        Some(idx) => idx,
        None => {
            nodes.push(node.clone());
            nodes.len() - 1
        }
    }
}

fn lookup<'a>(nodes: &'a [NodeId], map: &[Option<usize>], partition: u16) -> Option<&'a NodeId> {
    map.get(usize::from(partition))
        .copied()
        .flatten()
        .and_then(|idx| nodes.get(idx))
}

fn parse_map(rows: &[Vec<i32>]) -> Result<Vec<Option<usize>>, TopologyError> {
    rows.iter()
        .enumerate()
        .map(|(partition, row)| match row.first() {
            None => Err(TopologyError::Malformed(format!(
                "partition {partition} has an empty server row"
            ))),
            Some(idx) if *idx < 0 => Ok(None),
            Some(idx) => Ok(Some(*idx as usize)),
        })
        .collect()
}

fn render_map(map: &[Option<usize>]) -> Vec<Vec<i32>> {
    map.iter()
        .map(|owner| vec![owner.map_or(-1, |idx| idx as i32)])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "name": "default",
        "rev": 42,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["a:11210", "b:11210"],
            "vBucketMap": [[0, 1], [0, 1], [1, 0], [-1, 0]],
            "vBucketMapForward": [[1], [0], [1], [1]]
        }
    }"#;

    #[test]
    fn parses_bucket_config() {
        let table = TopologyTable::parse(CONFIG).expect("valid config");
        assert_eq!(table.revision(), 42);
        assert_eq!(table.partition_count(), 4);
        assert_eq!(table.owner(0), Some(&NodeId::new("a:11210")));
        assert_eq!(table.owner(2), Some(&NodeId::new("b:11210")));
        assert_eq!(table.owner(3), None);
        assert_eq!(table.forward_owner(0), Some(&NodeId::new("b:11210")));
        assert!(!table.is_ready());
    }

    #[test]
    fn rejects_out_of_range_server_index() {
        let config = CONFIG.replace("[1, 0]", "[7, 0]");
        let err = TopologyTable::parse(&config).expect_err("bad index");
        assert!(matches!(err, TopologyError::Malformed(_)));
    }

    #[test]
    fn rejects_unknown_hash_algorithm() {
        let config = CONFIG.replace("\"CRC\"", "\"KETAMA\"");
        assert!(TopologyTable::parse(&config).is_err());
    }

    #[test]
    fn bucket_config_roundtrips_through_table() {
        let a = NodeId::new("a:1");
        let b = NodeId::new("b:1");
        let table = TopologyTable::from_owners(3, &[a.clone(), b.clone(), b.clone()])
            .with_forward_owners(&[b.clone(), b.clone(), a.clone()]);
        let rendered = table.to_bucket_config("default");
        assert_eq!(rendered.server_map.vbucket_map, vec![vec![0], vec![1], vec![1]]);

        let reparsed = TopologyTable::from_bucket_config(&rendered).expect("reparse");
        assert_eq!(reparsed, table);
        assert_eq!(reparsed.partitions_of(&b), vec![1, 2]);
    }

    #[test]
    fn empty_table_is_not_ready() {
        let table = TopologyTable::empty();
        assert!(!table.is_ready());
        assert_eq!(table.owner(0), None);
    }
}
