use anyhow::Result;
use vbucket_client::{
    NodeId, TopologyTable,
    error::RoutingError,
    router::{partition_for_key, resolve, resolve_partition},
};

fn nodes() -> (NodeId, NodeId) {
    (NodeId::new("10.0.0.1:11210"), NodeId::new("10.0.0.2:11210"))
}

/// Partitions 0 and 1 on A, 2 and 3 on B.
fn split_table() -> TopologyTable {
    let (a, b) = nodes();
    TopologyTable::from_owners(1, &[a.clone(), a, b.clone(), b])
}

#[test]
fn same_key_same_node_every_time() {
    let table = split_table();
    for i in 0..500 {
        let key = format!("user::{i}");
        let first = resolve(key.as_bytes(), &table, false).expect("route");
        for _ in 0..8 {
            assert_eq!(resolve(key.as_bytes(), &table, false), Ok(first.clone()));
        }
        assert_eq!(
            first.partition,
            partition_for_key(key.as_bytes(), table.partition_count())
        );
    }
}

#[test]
fn keys_spread_over_every_partition() {
    let mut seen = [0usize; 64];
    for i in 0..10_000 {
        let key = format!("doc-{i}");
        seen[usize::from(partition_for_key(key.as_bytes(), seen.len()))] += 1;
    }
    assert!(seen.iter().all(|&hits| hits > 0), "{seen:?}");
}

#[test]
fn foo_routes_to_second_node() {
    let (_, b) = nodes();
    let route = resolve(b"foo", &split_table(), false).expect("route");
    assert_eq!(route.partition, 3);
    assert_eq!(route.node, b);
}

#[test]
fn bucket_config_document_parses() -> Result<()> {
    let table = TopologyTable::parse(
        r#"{
            "name": "default",
            "rev": 42,
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": 1,
                "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
                "vBucketMap": [[0, 1], [0, 1], [1, 0], [-1, 0]],
                "vBucketMapForward": [[1, 0], [0, 1], [1, 0], [1, 0]]
            }
        }"#,
    )?;
    let (a, b) = nodes();

    assert_eq!(table.revision(), 42);
    assert_eq!(table.partition_count(), 4);
    assert_eq!(table.owner(0), Some(&a));
    assert_eq!(table.owner(3), None);
    assert!(!table.is_ready());
    assert_eq!(table.forward_owner(0), Some(&b));

    // Unowned in the current map, but the forward map knows where it goes.
    assert_eq!(
        resolve_partition(3, &table, false),
        Err(RoutingError { partition: 3 })
    );
    assert_eq!(resolve_partition(3, &table, true).map(|r| r.node), Ok(b));
    Ok(())
}

#[test]
fn bucket_config_round_trips_through_json() -> Result<()> {
    let (_, b) = nodes();
    let table = split_table().with_forward_owners(&[b.clone(), b.clone(), b.clone(), b]);
    let json = serde_json::to_string(&table.to_bucket_config("default"))?;
    assert_eq!(TopologyTable::parse(&json)?, table);
    Ok(())
}

#[test]
fn foreign_hash_algorithm_is_refused() {
    let err = TopologyTable::parse(
        r#"{
            "name": "default",
            "vBucketServerMap": {
                "hashAlgorithm": "MD5",
                "serverList": ["a:1"],
                "vBucketMap": [[0]]
            }
        }"#,
    )
    .expect_err("only CRC is supported");
    assert!(err.to_string().contains("MD5"));
}

#[test]
fn map_pointing_past_server_list_is_refused() {
    let result = TopologyTable::parse(
        r#"{
            "name": "default",
            "vBucketServerMap": {
                "serverList": ["a:1"],
                "vBucketMap": [[0], [3]]
            }
        }"#,
    );
    assert!(result.is_err());
}
