//! A simulated data node speaking the client wire protocol over TCP.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use super::store::{NodeStore, PartitionData};
use crate::{
    protocol::{ClientMessage, Request, Response, ServerMessage, read_frame, write_frame},
    topology::NodeId,
};

/// State shared by every connection to one simulated node, and by the
/// in-process connector.
pub struct NodeState {
    id: NodeId,
    bucket: String,
    password: String,
    store: Mutex<NodeStore>,
    up: AtomicBool,
    requests: AtomicU64,
}

impl NodeState {
    pub fn new(
        id: NodeId,
        bucket: impl Into<String>,
        password: impl Into<String>,
        store: NodeStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            bucket: bucket.into(),
            password: password.into(),
            store: Mutex::new(store),
            up: AtomicBool::new(true),
            requests: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    /// Requests executed since the node was created.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Checks a bucket handshake. Returns the rejection reason on failure.
    pub fn authenticate(&self, bucket: &str, password: &str) -> Result<(), String> {
        if bucket != self.bucket {
            return Err(format!("unknown bucket {bucket}"));
        }
        if password != self.password {
            return Err("bad password".to_string());
        }
        Ok(())
    }

    pub fn execute(&self, request: Request) -> Response {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.store().execute(request)
    }

    pub fn item_count(&self) -> usize {
        self.store().len()
    }

    pub fn owned_partitions(&self) -> Vec<u16> {
        self.store().owned_partitions()
    }

    pub(crate) fn release(&self, partition: u16) -> Option<PartitionData> {
        self.store().release(partition)
    }

    pub(crate) fn adopt(&self, partition: u16, data: PartitionData) {
        self.store().adopt(partition, data);
    }

    fn store(&self) -> MutexGuard<'_, NodeStore> {
        // Store operations never panic halfway through an update.
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct SimNode {
    listener: TcpListener,
    state: Arc<NodeState>,
}

impl SimNode {
    pub fn new(listener: TcpListener, state: Arc<NodeState>) -> Self {
        Self { listener, state }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` resolves. Open connections are
    /// cut when it does, the way a crashed node would drop them.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let SimNode { listener, state } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = %state.id, open = connections.len(), "node stopping");
                    connections.abort_all();
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        connections.spawn(async move {
                            if let Err(err) = handle_connection(stream, &state).await {
                                debug!(node = %state.id, peer = %peer, error = ?err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(node = %state.id, error = ?err, "failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, state: &NodeState) -> Result<()> {
    stream.set_nodelay(true).context("set nodelay")?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let verdict = match read_frame::<_, ClientMessage>(&mut reader).await? {
        Some(ClientMessage::Hello { bucket, password }) => state.authenticate(&bucket, &password),
        Some(ClientMessage::Request(_)) => Err("expected hello".to_string()),
        None => return Ok(()),
    };
    match verdict {
        Ok(()) => {
            write_frame(
                &mut writer,
                &ServerMessage::Welcome {
                    node: state.id.to_string(),
                },
            )
            .await
            .context("write welcome")?;
        }
        Err(reason) => {
            warn!(node = %state.id, %reason, "rejecting client");
            write_frame(&mut writer, &ServerMessage::Rejected { reason })
                .await
                .context("write rejection")?;
            return Ok(());
        }
    }

    while let Some(message) = read_frame::<_, ClientMessage>(&mut reader).await? {
        match message {
            ClientMessage::Request(request) => {
                let response = state.execute(request);
                write_frame(&mut writer, &ServerMessage::Response(response))
                    .await
                    .context("write response")?;
            }
            ClientMessage::Hello { .. } => {
                debug!(node = %state.id, "ignoring repeated hello");
            }
        }
    }
    Ok(())
}
