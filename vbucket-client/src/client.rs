//! The public key-value API.
//!
//! Every method builds one [`Operation`], wraps it in a [`Command`] with the
//! configured timeout and waits for the dispatcher to resolve it. Multi-key
//! methods submit all their commands before waiting on any, and report each
//! key's outcome separately.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    command::{
        Command, ConcatMode, CounterDirection, Operation, PendingResult, Reply, StoreMode,
        expiry_secs,
    },
    config::ClientConfig,
    connection::{AuthContext, Connector, TcpConnector},
    dispatcher::Dispatcher,
    error::{Error, Result},
    protocol::Status,
    refresher::{HttpTopologySource, TopologyRefresher, TopologySource},
    topology::TopologyTable,
};

/// Longest key a node accepts.
pub const MAX_KEY_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterResult {
    pub value: u64,
    pub cas: u64,
}

impl From<Reply> for GetResult {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Value { value, flags, cas } => Self { value, flags, cas },
            other => Self {
                value: Vec::new(),
                flags: 0,
                cas: other.cas(),
            },
        }
    }
}

impl From<Reply> for MutationResult {
    fn from(reply: Reply) -> Self {
        Self { cas: reply.cas() }
    }
}

impl From<Reply> for CounterResult {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Counter { value, cas } => Self { value, cas },
            other => Self {
                value: 0,
                cas: other.cas(),
            },
        }
    }
}

/// Optional parts of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub flags: u32,
    pub expiry: Option<Duration>,
    /// Only store if the item's CAS still matches.
    pub cas: Option<u64>,
}

/// Per-key outcomes of a multi-key call, in submission order.
#[derive(Debug)]
pub struct MultiResult<T> {
    entries: Vec<(Vec<u8>, Result<T>)>,
}

impl<T> MultiResult<T> {
    /// Outcome for `key`. With duplicate keys, the first one wins.
    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<&Result<T>> {
        let key = key.as_ref();
        self.entries
            .iter()
            .find(|(candidate, _)| candidate.as_slice() == key)
            .map(|(_, result)| result)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Result<T>)> {
        self.entries
            .iter()
            .map(|(key, result)| (key.as_slice(), result))
    }

    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|(_, result)| result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&[u8], &Error)> {
        self.entries.iter().filter_map(|(key, result)| match result {
            Ok(_) => None,
            Err(error) => Some((key.as_slice(), error)),
        })
    }
}

impl<T> IntoIterator for MultiResult<T> {
    type Item = (Vec<u8>, Result<T>);
    type IntoIter = std::vec::IntoIter<(Vec<u8>, Result<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

pub struct Client {
    config: ClientConfig,
    refresher: Arc<TopologyRefresher>,
    dispatcher: Dispatcher,
    poller: Option<JoinHandle<()>>,
}

impl Client {
    /// Connects to a real cluster: fetches the bucket's partition map over
    /// HTTP and talks to the nodes over TCP.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let source = Arc::new(HttpTopologySource::new(&config)?);
        let connector = Arc::new(TcpConnector::new(
            AuthContext {
                bucket: config.bucket.clone(),
                password: config.password.clone(),
            },
            config.connect_timeout,
            config.max_queued_per_node,
        ));
        Self::with_parts(config, source, connector).await
    }

    /// Builds a client around caller-supplied topology and connection
    /// layers. Fails if the first topology fetch does.
    pub async fn with_parts(
        config: ClientConfig,
        source: Arc<dyn TopologySource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let refresher = Arc::new(TopologyRefresher::new(source, config.bucket.as_str()));
        let table = refresher.refresh(None).await?;
        info!(
            bucket = %config.bucket,
            revision = table.revision(),
            partitions = table.partition_count(),
            nodes = table.nodes().len(),
            "client bootstrapped"
        );

        let (dispatcher, _worker) = Dispatcher::spawn(&config, Arc::clone(&refresher), connector);
        let poller = config.topology_poll_interval.map(|every| {
            let refresher = Arc::clone(&refresher);
            tokio::spawn(async move {
                refresher.run_until(every, std::future::pending()).await;
            })
        });

        Ok(Self {
            config,
            refresher,
            dispatcher,
            poller,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The partition table currently used for routing.
    pub fn topology(&self) -> Arc<TopologyTable> {
        self.refresher.current()
    }

    /// Fetches the partition table now instead of waiting for the poller.
    pub async fn refresh_topology(&self) -> Result<Arc<TopologyTable>> {
        Ok(self.refresher.refresh(None).await?)
    }

    /// Topology fetches made so far, bootstrap included.
    pub fn refresh_count(&self) -> u64 {
        self.refresher.refresh_count()
    }

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<GetResult> {
        let key = key.as_ref().to_vec();
        self.execute(Operation::Get { key }).await.map(GetResult::from)
    }

    /// Fetches the item and resets its expiry.
    pub async fn get_and_touch(
        &self,
        key: impl AsRef<[u8]>,
        expiry: Duration,
    ) -> Result<GetResult> {
        let operation = Operation::GetAndTouch {
            key: key.as_ref().to_vec(),
            expiry: expiry_secs(Some(expiry)),
        };
        self.execute(operation).await.map(GetResult::from)
    }

    /// Fetches the item and write-locks it for `lock` (the node caps this
    /// at 30 seconds). The returned CAS unlocks it.
    pub async fn get_and_lock(&self, key: impl AsRef<[u8]>, lock: Duration) -> Result<GetResult> {
        let operation = Operation::GetAndLock {
            key: key.as_ref().to_vec(),
            lock_secs: expiry_secs(Some(lock)),
        };
        self.execute(operation).await.map(GetResult::from)
    }

    pub async fn unlock(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<MutationResult> {
        let operation = Operation::Unlock {
            key: key.as_ref().to_vec(),
            cas,
        };
        self.execute(operation).await.map(MutationResult::from)
    }

    pub async fn set(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<MutationResult> {
        self.store(StoreMode::Set, key, value, StoreOptions::default())
            .await
    }

    /// Stores only if the key does not exist yet.
    pub async fn add(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<MutationResult> {
        self.store(StoreMode::Add, key, value, StoreOptions::default())
            .await
    }

    /// Stores only if the key already exists.
    pub async fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<MutationResult> {
        self.store(StoreMode::Replace, key, value, StoreOptions::default())
            .await
    }

    /// Stores only if the item's CAS is still `cas`.
    pub async fn cas(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
        cas: u64,
    ) -> Result<MutationResult> {
        let options = StoreOptions {
            cas: Some(cas),
            ..StoreOptions::default()
        };
        self.store(StoreMode::Set, key, value, options).await
    }

    pub async fn store(
        &self,
        mode: StoreMode,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
        options: StoreOptions,
    ) -> Result<MutationResult> {
        let operation = store_operation(mode, key.as_ref(), value.into(), options);
        self.execute(operation).await.map(MutationResult::from)
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<MutationResult> {
        let operation = Operation::Delete {
            key: key.as_ref().to_vec(),
            cas: None,
        };
        self.execute(operation).await.map(MutationResult::from)
    }

    pub async fn delete_with_cas(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<MutationResult> {
        let operation = Operation::Delete {
            key: key.as_ref().to_vec(),
            cas: Some(cas),
        };
        self.execute(operation).await.map(MutationResult::from)
    }

    pub async fn append(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<MutationResult> {
        self.concat(ConcatMode::Append, key.as_ref(), value.into())
            .await
    }

    pub async fn prepend(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Vec<u8>>,
    ) -> Result<MutationResult> {
        self.concat(ConcatMode::Prepend, key.as_ref(), value.into())
            .await
    }

    /// Adds `delta` to a decimal counter. With `initial`, a missing counter
    /// is created with that value instead of failing.
    pub async fn incr(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: Option<u64>,
    ) -> Result<CounterResult> {
        self.counter(CounterDirection::Increment, key.as_ref(), delta, initial)
            .await
    }

    /// Like [`incr`](Self::incr), but never goes below zero.
    pub async fn decr(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: Option<u64>,
    ) -> Result<CounterResult> {
        self.counter(CounterDirection::Decrement, key.as_ref(), delta, initial)
            .await
    }

    pub async fn touch(&self, key: impl AsRef<[u8]>, expiry: Duration) -> Result<MutationResult> {
        let operation = Operation::Touch {
            key: key.as_ref().to_vec(),
            expiry: expiry_secs(Some(expiry)),
        };
        self.execute(operation).await.map(MutationResult::from)
    }

    /// Removes every item from every node in the current topology. Waits
    /// for all nodes and reports the first failure, if any.
    pub async fn flush(&self) -> Result<()> {
        let table = self.refresher.current();
        if table.nodes().is_empty() {
            return Err(Error::TopologyUnavailable(
                "no nodes known to flush".to_string(),
            ));
        }
        let commands = table
            .nodes()
            .iter()
            .map(|node| {
                Command::for_node(
                    Operation::FlushAll,
                    node.clone(),
                    self.config.operation_timeout,
                )
            })
            .collect();

        let pending = self.dispatcher.submit_multi(commands).await;
        let results = join_all(pending).await;
        info!(nodes = results.len(), "flushed bucket");
        results
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }

    pub async fn get_multi<I, K>(&self, keys: I) -> MultiResult<GetResult>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let operations = keys
            .into_iter()
            .map(|key| Operation::Get {
                key: key.as_ref().to_vec(),
            })
            .collect();
        self.execute_multi(operations).await
    }

    pub async fn set_multi<I, K, V>(&self, items: I) -> MultiResult<MutationResult>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: Into<Vec<u8>>,
    {
        let operations = items
            .into_iter()
            .map(|(key, value)| {
                store_operation(StoreMode::Set, key.as_ref(), value.into(), StoreOptions::default())
            })
            .collect();
        self.execute_multi(operations).await
    }

    pub async fn delete_multi<I, K>(&self, keys: I) -> MultiResult<MutationResult>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let operations = keys
            .into_iter()
            .map(|key| Operation::Delete {
                key: key.as_ref().to_vec(),
                cas: None,
            })
            .collect();
        self.execute_multi(operations).await
    }

    /// Stops background polling, fails whatever is still in flight with
    /// [`Error::Shutdown`] and closes every connection. Later calls fail
    /// with [`Error::Shutdown`] too.
    pub async fn shutdown(&self) {
        if let Some(poller) = &self.poller {
            poller.abort();
        }
        self.dispatcher.shutdown().await;
        info!(bucket = %self.config.bucket, "client shut down");
    }

    async fn concat(&self, mode: ConcatMode, key: &[u8], value: Vec<u8>) -> Result<MutationResult> {
        let operation = Operation::Concat {
            mode,
            key: key.to_vec(),
            value,
            cas: None,
        };
        self.execute(operation).await.map(MutationResult::from)
    }

    async fn counter(
        &self,
        direction: CounterDirection,
        key: &[u8],
        delta: u64,
        initial: Option<u64>,
    ) -> Result<CounterResult> {
        let operation = Operation::Counter {
            direction,
            key: key.to_vec(),
            delta,
            initial,
            expiry: 0,
        };
        self.execute(operation).await.map(CounterResult::from)
    }

    async fn execute(&self, operation: Operation) -> Result<Reply> {
        self.submit(operation).await.await
    }

    async fn execute_multi<T: From<Reply>>(&self, operations: Vec<Operation>) -> MultiResult<T> {
        let mut keys = Vec::with_capacity(operations.len());
        let mut pending = Vec::with_capacity(operations.len());
        for operation in operations {
            keys.push(operation.key().unwrap_or_default().to_vec());
            pending.push(self.submit(operation).await);
        }

        let results = join_all(pending).await;
        MultiResult {
            entries: keys
                .into_iter()
                .zip(results.into_iter().map(|result| result.map(T::from)))
                .collect(),
        }
    }

    async fn submit(&self, operation: Operation) -> PendingResult {
        if let Err(error) = check_key(operation.key()) {
            return PendingResult::failed(error);
        }
        let command = Command::new(operation, self.config.operation_timeout);
        self.dispatcher.submit(command).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(poller) = &self.poller {
            poller.abort();
        }
    }
}

fn store_operation(mode: StoreMode, key: &[u8], value: Vec<u8>, options: StoreOptions) -> Operation {
    Operation::Store {
        mode,
        key: key.to_vec(),
        value,
        flags: options.flags,
        expiry: expiry_secs(options.expiry),
        cas: options.cas,
    }
}

fn check_key(key: Option<&[u8]>) -> Result<()> {
    match key {
        Some(key) if key.is_empty() || key.len() > MAX_KEY_LEN => {
            Err(Error::Application(Status::InvalidArguments))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_bounded() {
        assert!(check_key(Some(&b"k"[..])).is_ok());
        assert!(check_key(None).is_ok());
        assert_eq!(
            check_key(Some(&b""[..])),
            Err(Error::Application(Status::InvalidArguments))
        );
        assert!(check_key(Some(&[b'k'; MAX_KEY_LEN + 1][..])).is_err());
    }

    #[test]
    fn multi_result_keeps_per_key_outcomes() {
        let results = MultiResult {
            entries: vec![
                (b"a".to_vec(), Ok(MutationResult { cas: 1 })),
                (b"b".to_vec(), Err(Error::Application(Status::KeyNotFound))),
            ],
        };

        assert_eq!(results.len(), 2);
        assert_eq!(results.success_count(), 1);
        assert_eq!(results.get("a"), Some(&Ok(MutationResult { cas: 1 })));
        assert!(results.get("b").expect("present").is_err());
        assert!(results.get("c").is_none());
        let failed: Vec<_> = results.failures().map(|(key, _)| key.to_vec()).collect();
        assert_eq!(failed, vec![b"b".to_vec()]);
    }

    #[test]
    fn replies_convert_to_results() {
        let reply = Reply::Value {
            value: b"v".to_vec(),
            flags: 2,
            cas: 9,
        };
        assert_eq!(
            GetResult::from(reply),
            GetResult {
                value: b"v".to_vec(),
                flags: 2,
                cas: 9
            }
        );
        assert_eq!(
            CounterResult::from(Reply::Counter { value: 4, cas: 5 }),
            CounterResult { value: 4, cas: 5 }
        );
        assert_eq!(MutationResult::from(Reply::Mutation { cas: 3 }).cas, 3);
    }
}
