//! Commands and their completion handles.
//!
//! An [`Operation`] says what to do. A [`Command`] wraps it with everything
//! the dispatcher needs while the operation is in flight: the correlation id,
//! the deadline, the retry bookkeeping and the sending half of a one-shot
//! completion. The caller keeps only the [`PendingResult`].

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
    error::{Error, Result},
    protocol::{Response, Status},
    topology::NodeId,
};

pub type CorrelationId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConcatMode {
    Append,
    Prepend,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CounterDirection {
    Increment,
    Decrement,
}

/// One key-value operation. Expiry and lock times are in seconds; an expiry
/// of zero means the item never expires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    Get {
        key: Vec<u8>,
    },
    GetAndTouch {
        key: Vec<u8>,
        expiry: u32,
    },
    GetAndLock {
        key: Vec<u8>,
        lock_secs: u32,
    },
    Unlock {
        key: Vec<u8>,
        cas: u64,
    },
    Store {
        mode: StoreMode,
        key: Vec<u8>,
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
        cas: Option<u64>,
    },
    Concat {
        mode: ConcatMode,
        key: Vec<u8>,
        value: Vec<u8>,
        cas: Option<u64>,
    },
    Counter {
        direction: CounterDirection,
        key: Vec<u8>,
        delta: u64,
        initial: Option<u64>,
        expiry: u32,
    },
    Delete {
        key: Vec<u8>,
        cas: Option<u64>,
    },
    Touch {
        key: Vec<u8>,
        expiry: u32,
    },
    FlushAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Gat,
    Getl,
    Unlock,
    Set,
    Add,
    Replace,
    Cas,
    Append,
    Prepend,
    Incr,
    Decr,
    Delete,
    Touch,
    FlushAll,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Get => "get",
            OpKind::Gat => "gat",
            OpKind::Getl => "getl",
            OpKind::Unlock => "unlock",
            OpKind::Set => "set",
            OpKind::Add => "add",
            OpKind::Replace => "replace",
            OpKind::Cas => "cas",
            OpKind::Append => "append",
            OpKind::Prepend => "prepend",
            OpKind::Incr => "incr",
            OpKind::Decr => "decr",
            OpKind::Delete => "delete",
            OpKind::Touch => "touch",
            OpKind::FlushAll => "flush_all",
        };
        f.write_str(name)
    }
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Get { .. } => OpKind::Get,
            Operation::GetAndTouch { .. } => OpKind::Gat,
            Operation::GetAndLock { .. } => OpKind::Getl,
            Operation::Unlock { .. } => OpKind::Unlock,
            Operation::Store {
                mode: StoreMode::Set,
                cas: Some(_),
                ..
            } => OpKind::Cas,
            Operation::Store { mode, .. } => match mode {
                StoreMode::Set => OpKind::Set,
                StoreMode::Add => OpKind::Add,
                StoreMode::Replace => OpKind::Replace,
            },
            Operation::Concat { mode, .. } => match mode {
                ConcatMode::Append => OpKind::Append,
                ConcatMode::Prepend => OpKind::Prepend,
            },
            Operation::Counter { direction, .. } => match direction {
                CounterDirection::Increment => OpKind::Incr,
                CounterDirection::Decrement => OpKind::Decr,
            },
            Operation::Delete { .. } => OpKind::Delete,
            Operation::Touch { .. } => OpKind::Touch,
            Operation::FlushAll => OpKind::FlushAll,
        }
    }

    /// The document key, or `None` for operations that address a whole node.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Operation::Get { key }
            | Operation::GetAndTouch { key, .. }
            | Operation::GetAndLock { key, .. }
            | Operation::Unlock { key, .. }
            | Operation::Store { key, .. }
            | Operation::Concat { key, .. }
            | Operation::Counter { key, .. }
            | Operation::Delete { key, .. }
            | Operation::Touch { key, .. } => Some(key),
            Operation::FlushAll => None,
        }
    }

    /// Builds the caller-facing reply from a successful response.
    pub fn reply(&self, response: &Response) -> Reply {
        match self {
            Operation::Get { .. } | Operation::GetAndTouch { .. } | Operation::GetAndLock { .. } => {
                Reply::Value {
                    value: response.value.clone().unwrap_or_default(),
                    flags: response.flags,
                    cas: response.cas,
                }
            }
            Operation::Counter { .. } => Reply::Counter {
                value: response.counter.unwrap_or_default(),
                cas: response.cas,
            },
            _ => Reply::Mutation { cas: response.cas },
        }
    }
}

/// Successful result of a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value { value: Vec<u8>, flags: u32, cas: u64 },
    Mutation { cas: u64 },
    Counter { value: u64, cas: u64 },
}

impl Reply {
    pub fn cas(&self) -> u64 {
        match self {
            Reply::Value { cas, .. } | Reply::Mutation { cas } | Reply::Counter { cas, .. } => *cas,
        }
    }
}

/// What the dispatcher should do with the result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Reply),
    /// The node does not own the partition any more.
    RoutingStale { partition: u16 },
    /// The connection broke or could not be established.
    ConnectionFault(String),
    /// The node asked the client to back off and try again.
    TemporaryFailure,
    ApplicationError(Status),
}

impl Outcome {
    pub fn classify(operation: &Operation, partition: u16, response: &Response) -> Self {
        match response.status {
            Status::Success => Outcome::Success(operation.reply(response)),
            Status::NotMyPartition => Outcome::RoutingStale { partition },
            Status::TemporaryFailure => Outcome::TemporaryFailure,
            status => Outcome::ApplicationError(status),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Route by hashing the operation's key.
    Key,
    /// Send to one node regardless of partition ownership.
    Node(NodeId),
}

/// Hands out correlation ids. Ids are never reused within one generator.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Command {
    pub(crate) id: CorrelationId,
    pub(crate) operation: Operation,
    pub(crate) target: Target,
    pub(crate) partition: Option<u16>,
    pub(crate) fastforward: bool,
    pub(crate) deadline: Instant,
    pub(crate) timeout: Duration,
    pub(crate) retries: u32,
    pub(crate) route_refreshes: u32,
    pub(crate) last_failure: Option<String>,
    completion: Completion,
    pending: Option<PendingResult>,
}

impl Command {
    pub fn new(operation: Operation, timeout: Duration) -> Self {
        Self::with_target(operation, Target::Key, timeout)
    }

    pub fn for_node(operation: Operation, node: NodeId, timeout: Duration) -> Self {
        Self::with_target(operation, Target::Node(node), timeout)
    }

    fn with_target(operation: Operation, target: Target, timeout: Duration) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            id: 0,
            operation,
            target,
            partition: None,
            fastforward: false,
            deadline: Instant::now() + timeout,
            timeout,
            retries: 0,
            route_refreshes: 0,
            last_failure: None,
            completion: Completion(Some(tx)),
            pending: Some(PendingResult { rx }),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn partition(&self) -> Option<u16> {
        self.partition
    }

    pub fn fastforward(&self) -> bool {
        self.fastforward
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.0.is_none()
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingResult> {
        self.pending.take()
    }

    /// Writes the result into the completion handle. Returns `false` if the
    /// command was already resolved, in which case nothing is written.
    pub(crate) fn resolve(&mut self, result: Result<Reply>) -> bool {
        self.completion.resolve(result)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("kind", &self.operation.kind())
            .field("target", &self.target)
            .field("partition", &self.partition)
            .field("fastforward", &self.fastforward)
            .field("retries", &self.retries)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

struct Completion(Option<oneshot::Sender<Result<Reply>>>);

impl Completion {
    fn resolve(&mut self, result: Result<Reply>) -> bool {
        match self.0.take() {
            Some(tx) => {
                // The caller may have stopped waiting; that is not our problem.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// The caller's side of a command. Resolves exactly once.
#[derive(Debug)]
pub struct PendingResult {
    rx: oneshot::Receiver<Result<Reply>>,
}

impl PendingResult {
    pub(crate) fn failed(err: Error) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for PendingResult {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Shutdown)))
    }
}

/// Converts an expiry into whole seconds, saturating at the wire limit.
pub fn expiry_secs(expiry: Option<Duration>) -> u32 {
    expiry
        .map(|expiry| u32::try_from(expiry.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_resolution_is_a_no_op() {
        let mut command = Command::new(Operation::Get { key: b"k".to_vec() }, Duration::from_secs(1));
        let pending = command.take_pending().expect("pending handle");

        assert!(command.resolve(Ok(Reply::Mutation { cas: 1 })));
        assert!(!command.resolve(Ok(Reply::Mutation { cas: 2 })));
        assert!(command.is_resolved());

        assert_eq!(pending.await, Ok(Reply::Mutation { cas: 1 }));
    }

    #[tokio::test]
    async fn dropped_command_reads_as_shutdown() {
        let mut command = Command::new(Operation::FlushAll, Duration::from_secs(1));
        let pending = command.take_pending().expect("pending handle");
        drop(command);
        assert_eq!(pending.await, Err(Error::Shutdown));
    }

    #[test]
    fn cas_store_reports_cas_kind() {
        let op = Operation::Store {
            mode: StoreMode::Set,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            flags: 0,
            expiry: 0,
            cas: Some(9),
        };
        assert_eq!(op.kind(), OpKind::Cas);
        assert_eq!(op.key(), Some(&b"k"[..]));
        assert_eq!(Operation::FlushAll.key(), None);
    }

    #[test]
    fn not_my_partition_classifies_as_stale() {
        let op = Operation::Get { key: b"k".to_vec() };
        let response = Response::new(1, Status::NotMyPartition);
        assert_eq!(
            Outcome::classify(&op, 5, &response),
            Outcome::RoutingStale { partition: 5 }
        );

        let response = Response::new(1, Status::KeyNotFound);
        assert_eq!(
            Outcome::classify(&op, 5, &response),
            Outcome::ApplicationError(Status::KeyNotFound)
        );
    }

    #[test]
    fn expiry_saturates() {
        assert_eq!(expiry_secs(None), 0);
        assert_eq!(expiry_secs(Some(Duration::from_secs(30))), 30);
        assert_eq!(expiry_secs(Some(Duration::from_secs(u64::MAX))), u32::MAX);
    }
}
