//! Point-to-point node connections.
//!
//! A [`NodeConnection`] accepts requests and reports everything that comes
//! back as [`NodeEvent`]s on a channel shared by all connections of a pool:
//! responses keyed by their opaque correlation id, and a single `Closed`
//! notice when the connection dies. Sending never waits for the response.
//!
//! [`TcpConnector`] builds [`TcpNodeConnection`]s: one writer task draining a
//! bounded outbound queue into the socket and one reader task forwarding
//! response frames. The bounded queue is what pushes back on senders when a
//! node falls behind.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    error::ConnectionError,
    protocol::{ClientMessage, Request, Response, ServerMessage, read_frame, write_frame},
    topology::NodeId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Response {
        node: NodeId,
        response: Response,
    },
    Closed {
        node: NodeId,
        generation: u64,
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<NodeEvent>;

#[async_trait]
pub trait NodeConnection: Send + Sync {
    fn node(&self) -> &NodeId;

    /// Distinguishes successive connections to the same node.
    fn generation(&self) -> u64;

    fn is_live(&self) -> bool;

    /// Queues `request` for the node, waiting while the outbound queue is full.
    async fn send(&self, request: Request) -> Result<(), ConnectionError>;

    /// Tears the connection down. Emits `Closed` if it was still live.
    fn close(&self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        node: &NodeId,
        generation: u64,
        events: EventSender,
    ) -> Result<Arc<dyn NodeConnection>, ConnectionError>;
}

/// Credentials presented when a connection selects its bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub bucket: String,
    pub password: String,
}

/// Liveness shared between a connection handle and its I/O tasks.
///
/// Whichever side notices the failure first flips `live` and reports it;
/// everybody else finds it already flipped and stays quiet.
pub struct LinkState {
    node: NodeId,
    generation: u64,
    live: AtomicBool,
    events: EventSender,
}

impl LinkState {
    pub fn new(node: NodeId, generation: u64, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            node,
            generation,
            live: AtomicBool::new(true),
            events,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn deliver(&self, response: Response) {
        let _ = self.events.send(NodeEvent::Response {
            node: self.node.clone(),
            response,
        });
    }

    /// Marks the link dead. Returns `true` for the caller that actually did it.
    pub fn shut(&self, reason: impl Into<String>) -> bool {
        if !self.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        let reason = reason.into();
        debug!(node = %self.node, generation = self.generation, %reason, "connection closed");
        let _ = self.events.send(NodeEvent::Closed {
            node: self.node.clone(),
            generation: self.generation,
            reason,
        });
        true
    }
}

pub struct TcpConnector {
    auth: AuthContext,
    connect_timeout: Duration,
    queue_depth: usize,
}

impl TcpConnector {
    pub fn new(auth: AuthContext, connect_timeout: Duration, queue_depth: usize) -> Self {
        Self {
            auth,
            connect_timeout,
            queue_depth,
        }
    }

    async fn open(
        &self,
        node: &NodeId,
    ) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), ConnectionError> {
        let connect_err = |reason: String| ConnectionError::Connect {
            node: node.to_string(),
            reason,
        };

        let stream = TcpStream::connect(node.as_str())
            .await
            .map_err(|err| connect_err(err.to_string()))?;
        if let Err(error) = stream.set_nodelay(true) {
            warn!(node = %node, ?error, "failed to disable nagle");
        }

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        write_frame(
            &mut writer,
            &ClientMessage::Hello {
                bucket: self.auth.bucket.clone(),
                password: self.auth.password.clone(),
            },
        )
        .await
        .map_err(|err| connect_err(format!("handshake write: {err}")))?;

        match read_frame::<_, ServerMessage>(&mut reader).await {
            Ok(Some(ServerMessage::Welcome { .. })) => Ok((reader, writer)),
            Ok(Some(ServerMessage::Rejected { reason })) => Err(ConnectionError::Auth {
                node: node.to_string(),
                reason,
            }),
            Ok(Some(other)) => Err(connect_err(format!("unexpected handshake reply {other:?}"))),
            Ok(None) => Err(connect_err("closed during handshake".to_string())),
            Err(err) => Err(connect_err(format!("handshake read: {err}"))),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        node: &NodeId,
        generation: u64,
        events: EventSender,
    ) -> Result<Arc<dyn NodeConnection>, ConnectionError> {
        let (reader, writer) = timeout(self.connect_timeout, self.open(node))
            .await
            .map_err(|_| ConnectionError::Connect {
                node: node.to_string(),
                reason: format!("timed out after {:?}", self.connect_timeout),
            })??;

        let link = LinkState::new(node.clone(), generation, events);
        Ok(Arc::new(TcpNodeConnection::start(
            link,
            reader,
            writer,
            self.queue_depth,
        )))
    }
}

pub struct TcpNodeConnection {
    link: Arc<LinkState>,
    outbound: mpsc::Sender<Request>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl TcpNodeConnection {
    fn start(
        link: Arc<LinkState>,
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        queue_depth: usize,
    ) -> Self {
        let (outbound, queue) = mpsc::channel(queue_depth.max(1));
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&link)));
        let writer_task = tokio::spawn(write_loop(writer, queue, Arc::clone(&link)));
        Self {
            link,
            outbound,
            reader_task,
            writer_task,
        }
    }
}

#[async_trait]
impl NodeConnection for TcpNodeConnection {
    fn node(&self) -> &NodeId {
        &self.link.node
    }

    fn generation(&self) -> u64 {
        self.link.generation
    }

    fn is_live(&self) -> bool {
        self.link.is_live()
    }

    async fn send(&self, request: Request) -> Result<(), ConnectionError> {
        let closed = || ConnectionError::Closed {
            node: self.link.node.to_string(),
        };
        if !self.link.is_live() {
            return Err(closed());
        }
        self.outbound.send(request).await.map_err(|_| closed())
    }

    fn close(&self) {
        self.link.shut("closed by client");
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for TcpNodeConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, link: Arc<LinkState>) {
    loop {
        match read_frame::<_, ServerMessage>(&mut reader).await {
            Ok(Some(ServerMessage::Response(response))) => link.deliver(response),
            Ok(Some(other)) => {
                debug!(node = %link.node, ?other, "ignoring unexpected frame");
            }
            Ok(None) => {
                link.shut("node closed the connection");
                return;
            }
            Err(err) => {
                link.shut(format!("read failed: {err}"));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Request>,
    link: Arc<LinkState>,
) {
    while let Some(request) = queue.recv().await {
        if let Err(err) = write_frame(&mut writer, &ClientMessage::Request(request)).await {
            link.shut(format!("write failed: {err}"));
            return;
        }
    }
    if let Err(error) = writer.shutdown().await {
        debug!(node = %link.node, ?error, "failed to shutdown writer cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_reports_closed_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = LinkState::new(NodeId::new("a:1"), 4, tx);

        assert!(link.shut("first"));
        assert!(!link.shut("second"));
        assert!(!link.is_live());

        assert_eq!(
            rx.try_recv().expect("closed event"),
            NodeEvent::Closed {
                node: NodeId::new("a:1"),
                generation: 4,
                reason: "first".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        let connector = TcpConnector::new(
            AuthContext {
                bucket: "default".into(),
                password: String::new(),
            },
            Duration::from_millis(500),
            8,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        // Port 1 on localhost is never a cluster node.
        let result = connector.connect(&NodeId::new("127.0.0.1:1"), 1, tx).await;
        assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    }
}
