//! Partition-aware client for a distributed document key-value store.
//!
//! Documents are spread over a fixed number of partitions ("vbuckets"), and
//! the cluster publishes which node currently owns each one. The client
//! hashes every key to its partition, sends the operation to the owning
//! node, and keeps doing so correctly while partitions move and nodes fail.
//!
//! - [`client`] is the public API: get, set, counters, locks, flush and the
//!   multi-key variants.
//! - [`dispatcher`] is the single worker that routes, sends, retries and
//!   resolves every command.
//! - [`router`] and [`topology`] map keys to partitions to nodes.
//! - [`refresher`] fetches the partition table and publishes it atomically.
//! - [`pool`] and [`connection`] own the per-node connections; [`protocol`]
//!   is their wire format.
//! - [`sim`] is an in-memory cluster for tests and local experiments.
//!
//! # Ordering
//!
//! Operations are not ordered with respect to each other, not even on the
//! same key: two concurrent writes to one key may land in either order. A
//! caller that needs one mutation to follow another must await the first
//! before submitting the second.
//!
//! ```no_run
//! # async fn demo() -> vbucket_client::Result<()> {
//! use vbucket_client::{Client, ClientConfig};
//!
//! let client = Client::connect(ClientConfig::new("http://127.0.0.1:8091", "default")).await?;
//! client.set("greeting", "hello").await?;
//! let found = client.get("greeting").await?;
//! assert_eq!(found.value, b"hello");
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod refresher;
pub mod router;
pub mod sim;
pub mod topology;

pub use client::{Client, CounterResult, GetResult, MultiResult, MutationResult, StoreOptions};
pub use command::{Command, Operation, PendingResult, Reply, StoreMode};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use protocol::Status;
pub use topology::{NodeId, TopologyTable};
