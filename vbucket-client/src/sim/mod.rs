//! A small simulated cluster for tests, demos and the `sim` subcommand.
//!
//! [`SimCluster`] runs a handful of [`SimNode`]s on loopback TCP ports plus
//! a [`SimAdmin`] HTTP endpoint publishing the partition map, and exposes
//! the knobs needed to exercise the client: moving partitions, publishing
//! forward maps mid-rebalance, stopping and restarting nodes, and taking the
//! admin endpoint offline.

mod admin;
mod local;
mod node;
mod store;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result, bail, ensure};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::info;

pub use admin::SimAdmin;
pub use local::LocalConnector;
pub use node::{NodeState, SimNode};
pub use store::{DEFAULT_MAX_VALUE_LEN, Item, NodeStore, PartitionData};

use crate::{
    config::ClientConfig,
    connection::AuthContext,
    error::TopologyError,
    topology::{NodeId, TopologyTable},
};

#[derive(Debug, Clone)]
pub struct SimClusterConfig {
    pub nodes: usize,
    pub partitions: u16,
    pub bucket: String,
    pub password: String,
    pub max_value_len: usize,
}

impl Default for SimClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            partitions: 64,
            bucket: "default".to_string(),
            password: String::new(),
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

/// The partition map the admin endpoint publishes.
pub(crate) struct ClusterMap {
    revision: u64,
    nodes: Vec<NodeId>,
    current: Vec<usize>,
    forward: Option<Vec<usize>>,
    available: bool,
}

impl ClusterMap {
    fn table(&self) -> Result<TopologyTable, TopologyError> {
        let owners = |map: &[usize]| map.iter().copied().map(Some).collect();
        TopologyTable::new(
            self.revision,
            self.nodes.clone(),
            owners(&self.current),
            self.forward.as_deref().map(owners),
        )
    }
}

struct Server {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Server {
    async fn stop(self) -> Result<()> {
        let _ = self.stop.send(());
        self.task.await.context("server task panicked")?
    }
}

struct SimNodeSlot {
    state: Arc<NodeState>,
    addr: SocketAddr,
    server: Option<Server>,
}

pub struct SimCluster {
    config: SimClusterConfig,
    nodes: Vec<SimNodeSlot>,
    map: Arc<Mutex<ClusterMap>>,
    admin_addr: SocketAddr,
    admin: Option<Server>,
}

impl SimCluster {
    /// Starts the nodes and the admin endpoint on ephemeral loopback ports.
    /// Partition `p` starts out on node `p % nodes`.
    pub async fn start(config: SimClusterConfig) -> Result<Self> {
        ensure!(config.nodes > 0, "a cluster needs at least one node");
        ensure!(config.partitions > 0, "a cluster needs at least one partition");

        let mut listeners = Vec::with_capacity(config.nodes);
        for _ in 0..config.nodes {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .context("bind node listener")?;
            listeners.push(listener);
        }

        let current: Vec<usize> = (0..usize::from(config.partitions))
            .map(|partition| partition % config.nodes)
            .collect();

        let mut nodes = Vec::with_capacity(config.nodes);
        for (index, listener) in listeners.into_iter().enumerate() {
            let addr = listener.local_addr().context("node address")?;
            let owned = (0..config.partitions).filter(|&p| current[usize::from(p)] == index);
            let state = NodeState::new(
                NodeId::from(addr),
                config.bucket.as_str(),
                config.password.as_str(),
                NodeStore::with_max_value_len(owned, config.max_value_len),
            );
            let server = serve_node(listener, Arc::clone(&state));
            nodes.push(SimNodeSlot {
                state,
                addr,
                server: Some(server),
            });
        }

        let map = Arc::new(Mutex::new(ClusterMap {
            revision: 1,
            nodes: nodes.iter().map(|slot| slot.state.id().clone()).collect(),
            current,
            forward: None,
            available: true,
        }));

        let admin_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind admin listener")?;
        let admin = SimAdmin::new(admin_listener, &config.bucket, Arc::clone(&map));
        let admin_addr = admin.local_addr().context("admin address")?;
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(admin.run_until(async move {
            let _ = stopped.await;
        }));

        info!(
            nodes = config.nodes,
            partitions = config.partitions,
            admin = %admin_addr,
            "simulated cluster started"
        );

        Ok(Self {
            config,
            nodes,
            map,
            admin_addr,
            admin: Some(Server { stop, task }),
        })
    }

    pub fn admin_url(&self) -> String {
        format!("http://{}", self.admin_addr)
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// A client configuration pointing at this cluster, with background
    /// polling off so that tests decide when the client learns of changes.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.admin_url(), self.config.bucket.as_str())
            .with_password(self.config.password.as_str())
            .with_topology_poll_interval(None)
    }

    /// Connects to the nodes in-process instead of over TCP.
    pub fn local_connector(&self) -> LocalConnector {
        LocalConnector::new(
            self.nodes.iter().map(|slot| Arc::clone(&slot.state)),
            AuthContext {
                bucket: self.config.bucket.clone(),
                password: self.config.password.clone(),
            },
        )
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|slot| slot.state.id().clone()).collect()
    }

    pub fn node(&self, index: usize) -> Option<&Arc<NodeState>> {
        self.nodes.get(index).map(|slot| &slot.state)
    }

    /// The table the admin endpoint currently publishes.
    pub fn topology(&self) -> Result<TopologyTable> {
        Ok(self.map().table()?)
    }

    pub fn revision(&self) -> u64 {
        self.map().revision
    }

    /// Index of the node the published map names as `partition`'s owner.
    pub fn owner_of(&self, partition: u16) -> Option<usize> {
        self.map().current.get(usize::from(partition)).copied()
    }

    /// With `false`, the admin endpoint answers 503 to every request.
    pub fn set_available(&self, available: bool) {
        self.map().available = available;
    }

    /// Publishes a forward map sending each `(partition, node)` pair to its
    /// new node. Nothing moves yet.
    pub fn begin_rebalance(&self, moves: &[(u16, usize)]) -> Result<()> {
        let mut map = self.map();
        let mut forward = map.forward.clone().unwrap_or_else(|| map.current.clone());
        for &(partition, to) in moves {
            self.check_move(partition, to)?;
            forward[usize::from(partition)] = to;
        }
        map.forward = Some(forward);
        map.revision += 1;
        info!(revision = map.revision, moves = moves.len(), "rebalance started");
        Ok(())
    }

    /// Moves `partition` to its forward-map owner on the nodes themselves,
    /// leaving the published current map untouched. Clients routing by the
    /// current map now hit a node that no longer owns the partition.
    pub fn transfer_partition(&self, partition: u16) -> Result<()> {
        let to = {
            let map = self.map();
            let Some(forward) = map.forward.as_ref() else {
                bail!("no rebalance in progress");
            };
            forward
                .get(usize::from(partition))
                .copied()
                .with_context(|| format!("partition {partition} out of range"))?
        };
        self.move_data(partition, to)
    }

    /// Publishes the forward map as the current map.
    pub fn finish_rebalance(&self) -> Result<()> {
        let mut map = self.map();
        let Some(forward) = map.forward.take() else {
            bail!("no rebalance in progress");
        };
        for (partition, &owner) in forward.iter().enumerate() {
            let partition = u16::try_from(partition).context("partition id")?;
            self.move_data(partition, owner)?;
        }
        map.current = forward;
        map.revision += 1;
        info!(revision = map.revision, "rebalance finished");
        Ok(())
    }

    /// Moves `partition` and its items to node `to` and publishes the change
    /// in one step.
    pub fn move_partition(&self, partition: u16, to: usize) -> Result<()> {
        self.check_move(partition, to)?;
        self.move_data(partition, to)?;
        let mut map = self.map();
        map.current[usize::from(partition)] = to;
        if let Some(forward) = map.forward.as_mut() {
            forward[usize::from(partition)] = to;
        }
        map.revision += 1;
        info!(partition, to, revision = map.revision, "partition moved");
        Ok(())
    }

    /// Stops node `index` and cuts its open connections. Its items survive
    /// for [`restart_node`](Self::restart_node).
    pub async fn stop_node(&mut self, index: usize) -> Result<()> {
        let slot = self.nodes.get_mut(index).context("no such node")?;
        slot.state.set_up(false);
        if let Some(server) = slot.server.take() {
            server.stop().await?;
        }
        info!(node = %slot.state.id(), "node stopped");
        Ok(())
    }

    pub async fn restart_node(&mut self, index: usize) -> Result<()> {
        let slot = self.nodes.get_mut(index).context("no such node")?;
        if slot.server.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(slot.addr)
            .await
            .with_context(|| format!("rebind {}", slot.addr))?;
        slot.state.set_up(true);
        slot.server = Some(serve_node(listener, Arc::clone(&slot.state)));
        info!(node = %slot.state.id(), "node restarted");
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        for slot in &mut self.nodes {
            slot.state.set_up(false);
            if let Some(server) = slot.server.take() {
                server.stop().await?;
            }
        }
        if let Some(admin) = self.admin.take() {
            admin.stop().await?;
        }
        info!("simulated cluster stopped");
        Ok(())
    }

    fn check_move(&self, partition: u16, to: usize) -> Result<()> {
        ensure!(
            partition < self.config.partitions,
            "partition {partition} out of range"
        );
        ensure!(to < self.nodes.len(), "node {to} out of range");
        Ok(())
    }

    fn move_data(&self, partition: u16, to: usize) -> Result<()> {
        let target = self.node(to).context("no such node")?;
        if target.owned_partitions().contains(&partition) {
            return Ok(());
        }
        let data = self
            .nodes
            .iter()
            .find_map(|slot| slot.state.release(partition))
            .unwrap_or_default();
        target.adopt(partition, data);
        Ok(())
    }

    fn map(&self) -> MutexGuard<'_, ClusterMap> {
        // Map updates never panic halfway through.
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SimCluster {
    fn drop(&mut self) {
        let servers = self.nodes.iter().filter_map(|slot| slot.server.as_ref());
        for server in servers.chain(self.admin.as_ref()) {
            server.task.abort();
        }
    }
}

fn serve_node(listener: TcpListener, state: Arc<NodeState>) -> Server {
    let (stop, stopped) = oneshot::channel();
    let node = SimNode::new(listener, state);
    let task = tokio::spawn(node.run_until(async move {
        let _ = stopped.await;
    }));
    Server { stop, task }
}
