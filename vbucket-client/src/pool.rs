//! Registry of node connections.
//!
//! Each node gets a slot with two locks: a synchronous one guarding the
//! current connection, held only to read or swap it, and an async creation
//! lock so that racing callers for the same node wait for a single connect.
//! The pool-wide map lock is held only long enough to find a slot, so one
//! node's slow connect never stalls traffic to another.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tracing::{debug, info};

use crate::{
    connection::{Connector, EventSender, NodeConnection},
    error::ConnectionError,
    topology::NodeId,
};

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    events: EventSender,
    slots: Mutex<HashMap<NodeId, Arc<Slot>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct Slot {
    current: Mutex<Option<Arc<dyn NodeConnection>>>,
    create: tokio::sync::Mutex<()>,
}

impl Slot {
    fn live(&self) -> Option<Arc<dyn NodeConnection>> {
        let mut current = lock(&self.current);
        if current.as_ref().is_some_and(|conn| conn.is_live()) {
            return current.clone();
        }
        *current = None;
        None
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, events: EventSender) -> Self {
        Self {
            connector,
            events,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the live connection for `node`, connecting if there is none.
    /// Failures are returned, never remembered: the next call tries again.
    pub async fn get_or_create(
        &self,
        node: &NodeId,
    ) -> Result<Arc<dyn NodeConnection>, ConnectionError> {
        self.ensure_open()?;
        let slot = self.slot(node);
        if let Some(conn) = slot.live() {
            return Ok(conn);
        }

        let _creating = slot.create.lock().await;
        if let Some(conn) = slot.live() {
            return Ok(conn);
        }
        self.ensure_open()?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        debug!(node = %node, generation, "connecting");
        let conn = self
            .connector
            .connect(node, generation, self.events.clone())
            .await?;

        if self.closed.load(Ordering::Acquire) {
            conn.close();
            return Err(ConnectionError::PoolClosed);
        }
        *lock(&slot.current) = Some(Arc::clone(&conn));
        info!(node = %node, generation, "connected");
        Ok(conn)
    }

    /// Drops and closes whatever connection `node` currently has.
    pub fn invalidate(&self, node: &NodeId) {
        let Some(slot) = self.existing_slot(node) else {
            return;
        };
        let current = lock(&slot.current).take();
        if let Some(conn) = current {
            info!(node = %node, generation = conn.generation(), "invalidating connection");
            conn.close();
        }
    }

    /// Like [`invalidate`](Self::invalidate), but only if the current
    /// connection is `generation`. A fault reported against an older
    /// connection leaves its replacement alone.
    pub fn invalidate_generation(&self, node: &NodeId, generation: u64) {
        let Some(slot) = self.existing_slot(node) else {
            return;
        };
        let stale = {
            let mut current = lock(&slot.current);
            if current.as_ref().is_some_and(|conn| conn.generation() == generation) {
                current.take()
            } else {
                None
            }
        };
        if let Some(conn) = stale {
            info!(node = %node, generation, "invalidating connection");
            conn.close();
        }
    }

    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let slots: Vec<_> = lock(&self.slots).drain().collect();
        for (node, slot) in slots {
            let current = lock(&slot.current).take();
            if let Some(conn) = current {
                debug!(node = %node, "closing connection");
                conn.close();
            }
        }
    }

    /// Nodes that currently hold a live connection.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let slots: Vec<_> = lock(&self.slots)
            .iter()
            .map(|(node, slot)| (node.clone(), Arc::clone(slot)))
            .collect();
        let mut nodes: Vec<_> = slots
            .into_iter()
            .filter(|(_, slot)| slot.live().is_some())
            .map(|(node, _)| node)
            .collect();
        nodes.sort();
        nodes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            Err(ConnectionError::PoolClosed)
        } else {
            Ok(())
        }
    }

    fn slot(&self, node: &NodeId) -> Arc<Slot> {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(node.clone()).or_default())
    }

    fn existing_slot(&self, node: &NodeId) -> Option<Arc<Slot>> {
        lock(&self.slots).get(node).cloned()
    }
}

/// Nothing under these locks can panic midway, so a poisoned lock still
/// holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::Duration};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{connection::LinkState, protocol::Request};

    struct StubConnection {
        link: Arc<LinkState>,
    }

    #[async_trait]
    impl NodeConnection for StubConnection {
        fn node(&self) -> &NodeId {
            self.link.node()
        }

        fn generation(&self) -> u64 {
            self.link.generation()
        }

        fn is_live(&self) -> bool {
            self.link.is_live()
        }

        async fn send(&self, _request: Request) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn close(&self) {
            self.link.shut("closed");
        }
    }

    /// Counts connects; nodes named `down:*` refuse, `slow:*` take a while.
    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            node: &NodeId,
            generation: u64,
            events: EventSender,
        ) -> Result<Arc<dyn NodeConnection>, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if node.as_str().starts_with("down") {
                return Err(ConnectionError::Connect {
                    node: node.to_string(),
                    reason: "refused".into(),
                });
            }
            if node.as_str().starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(Arc::new(StubConnection {
                link: LinkState::new(node.clone(), generation, events),
            }))
        }
    }

    fn pool() -> (Arc<ConnectionPool>, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ConnectionPool::new(connector.clone(), tx));
        (pool, connector)
    }

    #[tokio::test]
    async fn racing_callers_share_one_connection() {
        let (pool, connector) = pool();
        let node = NodeId::new("a:1");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let node = node.clone();
                tokio::spawn(async move { pool.get_or_create(&node).await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("connect");
        }

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.connected_nodes(), vec![node]);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (pool, connector) = pool();
        let node = NodeId::new("down:1");

        assert!(pool.get_or_create(&node).await.is_err());
        assert!(pool.get_or_create(&node).await.is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_connect() {
        let (pool, connector) = pool();
        let node = NodeId::new("a:1");

        let first = pool.get_or_create(&node).await.expect("connect");
        pool.invalidate(&node);
        assert!(!first.is_live());

        pool.get_or_create(&node).await.expect("reconnect");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_generation_does_not_evict_replacement() {
        let (pool, _) = pool();
        let node = NodeId::new("a:1");
        let conn = pool.get_or_create(&node).await.expect("connect");

        pool.invalidate_generation(&node, conn.generation() + 1);
        assert!(conn.is_live());

        pool.invalidate_generation(&node, conn.generation());
        assert!(!conn.is_live());
    }

    #[tokio::test]
    async fn slow_node_does_not_block_others() {
        let (pool, _) = pool();
        let slow = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.get_or_create(&NodeId::new("slow:1")).await.map(|_| ()) })
        };

        tokio::time::timeout(Duration::from_millis(150), pool.get_or_create(&NodeId::new("b:1")))
            .await
            .expect("fast node not blocked by slow connect")
            .expect("connect");
        slow.await.expect("join").expect("slow connect");
    }

    #[tokio::test]
    async fn close_all_refuses_new_connections() {
        let (pool, _) = pool();
        let conn = pool.get_or_create(&NodeId::new("a:1")).await.expect("connect");
        pool.close_all();
        assert!(!conn.is_live());
        assert!(matches!(
            pool.get_or_create(&NodeId::new("a:1")).await,
            Err(ConnectionError::PoolClosed)
        ));
    }
}
