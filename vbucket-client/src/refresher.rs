//! Fetching and publishing the partition table.
//!
//! The current table lives in a `tokio::sync::watch` channel as an
//! `Arc<TopologyTable>`: routing takes a cheap clone of the pointer, a
//! refresh swaps in a new one, and nobody ever waits on a lock held across
//! I/O.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{select, sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::{Error, TopologyError},
    topology::{BucketConfig, TopologyTable},
};

/// Anything that can produce the current partition table for a bucket.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch_topology(&self, bucket: &str) -> Result<TopologyTable, TopologyError>;
}

/// Reads the bucket configuration from the cluster's administrative HTTP
/// interface, trying each bootstrap URL in turn.
pub struct HttpTopologySource {
    http: reqwest::Client,
    base_urls: Vec<String>,
    password: String,
    rounds: u32,
    backoff: Duration,
}

impl HttpTopologySource {
    pub fn new(config: &ClientConfig) -> Result<Self, Error> {
        if config.bootstrap_urls.is_empty() {
            return Err(Error::Config("at least one bootstrap url is required".into()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout.saturating_mul(2))
            .build()
            .map_err(|err| Error::Config(format!("http client: {err}")))?;

        Ok(Self {
            http,
            base_urls: config.bootstrap_urls.clone(),
            password: config.password.clone(),
            rounds: config.topology_fetch_rounds.max(1),
            backoff: config.topology_fetch_backoff,
        })
    }

    async fn fetch_from(&self, base: &str, bucket: &str) -> Result<TopologyTable, String> {
        let url = format!("{}/pools/default/buckets/{bucket}", base.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .basic_auth(bucket, Some(&self.password))
            .send()
            .await
            .map_err(|err| format!("{url}: {err}"))?
            .error_for_status()
            .map_err(|err| format!("{url}: {err}"))?;
        let config: BucketConfig = response
            .json()
            .await
            .map_err(|err| format!("{url}: {err}"))?;
        TopologyTable::from_bucket_config(&config).map_err(|err| format!("{url}: {err}"))
    }
}

#[async_trait]
impl TopologySource for HttpTopologySource {
    async fn fetch_topology(&self, bucket: &str) -> Result<TopologyTable, TopologyError> {
        let mut last_error = String::from("no bootstrap urls");
        for round in 0..self.rounds {
            if round > 0 {
                tokio::time::sleep(self.backoff).await;
            }
            for base in &self.base_urls {
                match self.fetch_from(base, bucket).await {
                    Ok(table) => return Ok(table),
                    Err(error) => {
                        debug!(round, %error, "topology fetch failed");
                        last_error = error;
                    }
                }
            }
        }
        Err(TopologyError::Unavailable(format!(
            "no bootstrap endpoint answered after {} rounds; last error: {last_error}",
            self.rounds
        )))
    }
}

pub struct TopologyRefresher {
    source: Arc<dyn TopologySource>,
    bucket: String,
    current: watch::Sender<Arc<TopologyTable>>,
    refreshes: AtomicU64,
}

impl TopologyRefresher {
    pub fn new(source: Arc<dyn TopologySource>, bucket: impl Into<String>) -> Self {
        let (current, _) = watch::channel(Arc::new(TopologyTable::empty()));
        Self {
            source,
            bucket: bucket.into(),
            current,
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn current(&self) -> Arc<TopologyTable> {
        Arc::clone(&self.current.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyTable>> {
        self.current.subscribe()
    }

    /// Number of `refresh` calls made so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Fetches a fresh table and publishes it. `target_partition` only
    /// annotates the logs; the whole table is always fetched.
    pub async fn refresh(
        &self,
        target_partition: Option<u16>,
    ) -> Result<Arc<TopologyTable>, TopologyError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(bucket = %self.bucket, ?target_partition, "refreshing topology");

        match self.source.fetch_topology(&self.bucket).await {
            Ok(table) => Ok(self.install(table)),
            Err(error) => {
                warn!(bucket = %self.bucket, %error, "topology refresh failed");
                Err(error)
            }
        }
    }

    /// Publishes `table` unless the current one has a newer revision, and
    /// returns whichever table is current afterwards.
    pub fn install(&self, table: TopologyTable) -> Arc<TopologyTable> {
        let table = Arc::new(table);
        let mut installed = Arc::clone(&table);
        self.current.send_if_modified(|current| {
            if table.revision() < current.revision() {
                debug!(
                    fetched = table.revision(),
                    current = current.revision(),
                    "ignoring older topology"
                );
                installed = Arc::clone(current);
                return false;
            }
            if **current == *table {
                return false;
            }
            info!(
                bucket = %self.bucket,
                revision = table.revision(),
                partitions = table.partition_count(),
                nodes = table.nodes().len(),
                rebalancing = table.has_forward_map(),
                "installed topology"
            );
            *current = Arc::clone(&table);
            true
        });
        installed
    }

    /// Polls the source every `every` until `shutdown` resolves. Failed
    /// polls are logged and the loop carries on.
    pub async fn run_until<F>(&self, every: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the caller has just bootstrapped.
        ticker.tick().await;

        loop {
            select! {
                _ = &mut shutdown => {
                    debug!(bucket = %self.bucket, "topology poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are already logged by `refresh`.
                    let _ = self.refresh(None).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::topology::NodeId;

    /// Hands out the queued tables in order, then reports unavailability.
    struct QueuedSource {
        tables: Mutex<Vec<TopologyTable>>,
    }

    #[async_trait]
    impl TopologySource for QueuedSource {
        async fn fetch_topology(&self, _bucket: &str) -> Result<TopologyTable, TopologyError> {
            let mut tables = self.tables.lock().unwrap();
            if tables.is_empty() {
                return Err(TopologyError::Unavailable("exhausted".into()));
            }
            Ok(tables.remove(0))
        }
    }

    fn table(revision: u64, owner: &str) -> TopologyTable {
        TopologyTable::from_owners(revision, &[NodeId::new(owner)])
    }

    #[tokio::test]
    async fn refresh_swaps_current_table() {
        let source = Arc::new(QueuedSource {
            tables: Mutex::new(vec![table(1, "a:1"), table(2, "b:1")]),
        });
        let refresher = TopologyRefresher::new(source, "default");
        let mut watcher = refresher.subscribe();

        assert!(!refresher.current().is_ready());
        refresher.refresh(Some(0)).await.expect("first");
        assert_eq!(refresher.current().owner(0), Some(&NodeId::new("a:1")));
        assert!(watcher.has_changed().expect("sender alive"));
        watcher.borrow_and_update();

        refresher.refresh(None).await.expect("second");
        assert_eq!(refresher.current().revision(), 2);
        assert_eq!(refresher.refresh_count(), 2);

        let err = refresher.refresh(None).await.expect_err("unavailable");
        assert!(matches!(err, TopologyError::Unavailable(_)));
        // A failed refresh keeps the last good table.
        assert_eq!(refresher.current().revision(), 2);
    }

    #[tokio::test]
    async fn older_revision_does_not_replace_newer() {
        let source = Arc::new(QueuedSource {
            tables: Mutex::new(Vec::new()),
        });
        let refresher = TopologyRefresher::new(source, "default");

        refresher.install(table(5, "a:1"));
        let installed = refresher.install(table(4, "b:1"));

        assert_eq!(installed.revision(), 5);
        assert_eq!(refresher.current().owner(0), Some(&NodeId::new("a:1")));
    }

    #[tokio::test]
    async fn poller_stops_on_shutdown() {
        let source = Arc::new(QueuedSource {
            tables: Mutex::new(vec![table(1, "a:1"), table(2, "a:1"), table(3, "a:1")]),
        });
        let refresher = Arc::new(TopologyRefresher::new(source, "default"));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let poller = {
            let refresher = Arc::clone(&refresher);
            tokio::spawn(async move {
                refresher
                    .run_until(Duration::from_millis(10), async move {
                        let _ = stop_rx.await;
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = stop_tx.send(());
        tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poller exits")
            .expect("join");
        assert!(refresher.refresh_count() >= 2);
    }
}
