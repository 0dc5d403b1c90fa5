//! The command dispatcher.
//!
//! A single worker task owns every in-flight command. Callers hand commands
//! over through a bounded channel and get a [`PendingResult`] back; the
//! worker routes each command, spawns a small task to push it down the
//! node's connection, and resolves it when a response, a timeout or a
//! terminal failure arrives.
//!
//! Per command the worker walks this state machine:
//!
//! ```text
//! Queued -> Routing -> Sent -> Completed
//!              ^   \     |  \-> Failed
//!              |    v    v
//!              | Waiting Retrying (backoff or waiting on a topology refresh)
//!              +-----------+
//! ```
//!
//! Every transition checks the command's deadline, and a timer heap makes
//! sure an idle command still fails when its deadline passes. Each attempt
//! gets a fresh correlation id, so a response to an abandoned attempt finds
//! nothing to resolve and is dropped.
//!
//! A node has at most `max_in_flight_per_node` commands sent and
//! unanswered. Commands beyond that wait in a per-node queue, and once
//! `max_waiting_commands` are waiting the worker stops reading submissions,
//! so a stalled node pushes back on callers instead of piling up work.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, timeout_at},
};
use tracing::{debug, info, trace, warn};

use crate::{
    command::{Command, CorrelationId, IdGenerator, Outcome, PendingResult, Reply, Target},
    config::ClientConfig,
    connection::{Connector, NodeEvent},
    error::{ConnectionError, Error, Result, RoutingError, TopologyError},
    pool::ConnectionPool,
    protocol::Request,
    refresher::TopologyRefresher,
    router::{self, Route},
    topology::{NodeId, TopologyTable},
};

/// How long the worker sleeps when no timer is armed. Any message wakes it.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// Handle for submitting commands. Cheap to clone; the worker stops once
/// every handle is gone or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct Dispatcher {
    inbound: mpsc::Sender<Command>,
    control: mpsc::Sender<oneshot::Sender<()>>,
}

impl Dispatcher {
    pub fn spawn(
        config: &ClientConfig,
        refresher: Arc<TopologyRefresher>,
        connector: Arc<dyn Connector>,
    ) -> (Self, JoinHandle<()>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth.max(1));
        let (control_tx, control_rx) = mpsc::channel(4);
        let (node_tx, node_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            config: config.clone(),
            refresher,
            pool: Arc::new(ConnectionPool::new(connector, node_tx)),
            ids: IdGenerator::new(),
            inbound: inbound_rx,
            control: control_rx,
            node_events: node_rx,
            task_tx,
            task_events: task_rx,
            in_flight: HashMap::new(),
            timers: BinaryHeap::new(),
            parked: Vec::new(),
            refresh_in_flight: false,
            sent_per_node: HashMap::new(),
            waiting: HashMap::new(),
            waiting_total: 0,
        };
        let handle = tokio::spawn(worker.run());
        (
            Self {
                inbound: inbound_tx,
                control: control_tx,
            },
            handle,
        )
    }

    /// Hands `command` to the worker. Waits while the inbound queue is full,
    /// which includes while too many commands wait on busy nodes; the
    /// returned future resolves once the command finishes.
    pub async fn submit(&self, mut command: Command) -> PendingResult {
        let Some(pending) = command.take_pending() else {
            return PendingResult::failed(Error::Shutdown);
        };
        // If the worker is gone the command is dropped here, which resolves
        // `pending` as `Shutdown`.
        let _ = self.inbound.send(command).await;
        pending
    }

    /// Submits every command before waiting on any of them.
    pub async fn submit_multi(&self, commands: Vec<Command>) -> Vec<PendingResult> {
        let mut pending = Vec::with_capacity(commands.len());
        for command in commands {
            pending.push(self.submit(command).await);
        }
        pending
    }

    /// Fails everything still in flight with [`Error::Shutdown`], closes all
    /// connections and stops the worker. Does not wait behind a full
    /// inbound queue.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.control.send(done_tx).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

/// Reports from tasks the worker spawned.
enum TaskEvent {
    Sent {
        id: CorrelationId,
        generation: u64,
    },
    SendFailed {
        id: CorrelationId,
        node: NodeId,
        generation: Option<u64>,
        error: ConnectionError,
    },
    /// The deadline passed before the request could be written; it never
    /// reached the node.
    Abandoned {
        id: CorrelationId,
    },
    Refreshed(Result<Arc<TopologyTable>, TopologyError>),
}

struct InFlight {
    command: Command,
    stage: Stage,
}

enum Stage {
    /// Handed to a send task. `generation` is filled in once the send task
    /// reports which connection carried the request; `closed` collects the
    /// connections of this node that died before that report.
    Sent {
        node: NodeId,
        partition: u16,
        generation: Option<u64>,
        closed: Vec<u64>,
    },
    /// Routed, but the node already has its fill of commands in flight.
    Waiting {
        node: NodeId,
        partition: u16,
    },
    AwaitingTopology,
    Backoff {
        until: Instant,
    },
}

struct SentAttempt {
    command: Command,
    node: NodeId,
    partition: u16,
}

struct Worker {
    config: ClientConfig,
    refresher: Arc<TopologyRefresher>,
    pool: Arc<ConnectionPool>,
    ids: IdGenerator,

    inbound: mpsc::Receiver<Command>,
    control: mpsc::Receiver<oneshot::Sender<()>>,
    node_events: mpsc::UnboundedReceiver<NodeEvent>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    task_events: mpsc::UnboundedReceiver<TaskEvent>,

    in_flight: HashMap<CorrelationId, InFlight>,
    /// Deadlines and backoff expiries, earliest first. Entries for ids that
    /// are no longer in flight are skipped when they come due.
    timers: BinaryHeap<Reverse<(Instant, CorrelationId)>>,
    parked: Vec<CorrelationId>,
    refresh_in_flight: bool,

    /// Entries in `Stage::Sent`, per node.
    sent_per_node: HashMap<NodeId, usize>,
    /// Ids in `Stage::Waiting`, per node, oldest first.
    waiting: HashMap<NodeId, VecDeque<CorrelationId>>,
    waiting_total: usize,
}

impl Worker {
    async fn run(mut self) {
        debug!(bucket = %self.refresher.bucket(), "dispatcher started");
        loop {
            let next_timer = self.timers.peek().map(|Reverse((at, _))| *at);
            let wake = next_timer
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_WAKE);
            let accepting = self.waiting_total < self.config.max_waiting_commands;

            select! {
                biased;

                Some(done) = self.control.recv() => {
                    self.shut_down();
                    let _ = done.send(());
                    return;
                }
                Some(event) = self.task_events.recv() => self.on_task_event(event),
                Some(event) = self.node_events.recv() => self.on_node_event(event),
                _ = sleep_until(wake), if next_timer.is_some() => self.fire_timers(),
                submission = self.inbound.recv(), if accepting => match submission {
                    Some(command) => self.accept(command),
                    None => {
                        self.shut_down();
                        return;
                    }
                },
            }

            self.promote_waiting();
        }
    }

    fn accept(&mut self, mut command: Command) {
        self.assign_id(&mut command);
        trace!(id = command.id, kind = %command.operation.kind(), "accepted");
        self.route(command);
    }

    /// Gives the command a fresh correlation id for its next attempt and
    /// arms its deadline under that id.
    fn assign_id(&mut self, command: &mut Command) {
        command.id = self.ids.next_id();
        self.timers.push(Reverse((command.deadline, command.id)));
    }

    fn route(&mut self, mut command: Command) {
        if Instant::now() >= command.deadline {
            return self.time_out(command);
        }

        let resolved = match &command.target {
            Target::Node(node) => Ok(Route {
                partition: 0,
                node: node.clone(),
            }),
            Target::Key => {
                let table = self.refresher.current();
                let key = command.operation.key().unwrap_or_default();
                let partition = router::partition_for_key(key, table.partition_count());
                command.partition = Some(partition);
                router::resolve_partition(partition, &table, command.fastforward)
            }
        };

        match resolved {
            Ok(route) => self.send(command, route),
            Err(RoutingError { partition }) => {
                if command.route_refreshes >= self.config.max_route_refreshes {
                    warn!(id = command.id, partition, "no node owns partition");
                    return self.finish(command, Err(Error::NoRoute { partition }));
                }
                command.route_refreshes += 1;
                debug!(
                    id = command.id,
                    partition,
                    attempt = command.route_refreshes,
                    "partition has no owner; waiting on topology"
                );
                self.park(command, Some(partition));
            }
        }
    }

    fn has_capacity(&self, node: &NodeId) -> bool {
        self.sent_per_node.get(node).copied().unwrap_or(0) < self.config.max_in_flight_per_node
    }

    fn send(&mut self, command: Command, route: Route) {
        if self.has_capacity(&route.node) {
            return self.dispatch(command, route);
        }
        trace!(id = command.id, node = %route.node, "node busy; waiting");
        self.insert(
            command.id,
            InFlight {
                command,
                stage: Stage::Waiting {
                    node: route.node,
                    partition: route.partition,
                },
            },
        );
    }

    fn dispatch(&mut self, command: Command, route: Route) {
        if Instant::now() >= command.deadline {
            return self.time_out(command);
        }

        let id = command.id;
        let deadline = command.deadline;
        let request = Request {
            opaque: id,
            partition: route.partition,
            operation: command.operation.clone(),
        };
        trace!(
            id,
            node = %route.node,
            partition = route.partition,
            kind = %command.operation.kind(),
            "sending"
        );
        self.insert(
            id,
            InFlight {
                command,
                stage: Stage::Sent {
                    node: route.node.clone(),
                    partition: route.partition,
                    generation: None,
                    closed: Vec::new(),
                },
            },
        );

        let pool = Arc::clone(&self.pool);
        let events = self.task_tx.clone();
        let node = route.node;
        tokio::spawn(async move {
            let event = match pool.get_or_create(&node).await {
                Ok(_) if Instant::now() >= deadline => TaskEvent::Abandoned { id },
                Ok(conn) => {
                    let generation = conn.generation();
                    let deadline = tokio::time::Instant::from_std(deadline);
                    match timeout_at(deadline, conn.send(request)).await {
                        Ok(Ok(())) => TaskEvent::Sent { id, generation },
                        Ok(Err(error)) => TaskEvent::SendFailed {
                            id,
                            node,
                            generation: Some(generation),
                            error,
                        },
                        Err(_) => TaskEvent::Abandoned { id },
                    }
                }
                Err(error) => TaskEvent::SendFailed {
                    id,
                    node,
                    generation: None,
                    error,
                },
            };
            let _ = events.send(event);
        });
    }

    /// Moves waiting commands onto nodes that have room again.
    fn promote_waiting(&mut self) {
        if self.waiting_total == 0 {
            return;
        }
        let ready: Vec<NodeId> = self
            .waiting
            .iter()
            .filter(|(node, queue)| !queue.is_empty() && self.has_capacity(node))
            .map(|(node, _)| node.clone())
            .collect();

        for node in ready {
            while self.has_capacity(&node) {
                let Some(id) = self.waiting.get_mut(&node).and_then(VecDeque::pop_front) else {
                    break;
                };
                let waiting = matches!(
                    self.in_flight.get(&id),
                    Some(InFlight {
                        stage: Stage::Waiting { .. },
                        ..
                    })
                );
                if !waiting {
                    continue;
                }
                if let Some(InFlight {
                    command,
                    stage: Stage::Waiting { partition, .. },
                }) = self.remove(id)
                {
                    self.dispatch(
                        command,
                        Route {
                            partition,
                            node: node.clone(),
                        },
                    );
                }
            }
        }
        self.waiting.retain(|_, queue| !queue.is_empty());
    }

    fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Sent { id, generation } => {
                let lost = match self.in_flight.get_mut(&id) {
                    Some(InFlight {
                        stage:
                            Stage::Sent {
                                generation: acked,
                                closed,
                                ..
                            },
                        ..
                    }) => {
                        *acked = Some(generation);
                        closed.contains(&generation)
                    }
                    _ => false,
                };
                if lost {
                    if let Some(attempt) = self.take_sent(id) {
                        debug!(id, node = %attempt.node, generation, "connection closed under a sent request");
                        self.apply(
                            attempt.command,
                            Outcome::ConnectionFault(format!(
                                "connection to {} closed",
                                attempt.node
                            )),
                        );
                    }
                }
            }
            TaskEvent::SendFailed {
                id,
                node,
                generation,
                error,
            } => {
                let Some(attempt) = self.take_sent(id) else {
                    return;
                };
                if let Some(generation) = generation {
                    self.pool.invalidate_generation(&node, generation);
                }
                match error {
                    ConnectionError::PoolClosed => self.finish(attempt.command, Err(Error::Shutdown)),
                    ConnectionError::Auth { .. } => {
                        warn!(node = %node, %error, "bucket authentication rejected");
                        self.finish(attempt.command, Err(Error::Connection(error.to_string())));
                    }
                    error => {
                        debug!(id, node = %node, %error, "send failed");
                        self.apply(attempt.command, Outcome::ConnectionFault(error.to_string()));
                    }
                }
            }
            TaskEvent::Abandoned { id } => {
                if let Some(attempt) = self.take_sent(id) {
                    self.time_out(attempt.command);
                }
            }
            TaskEvent::Refreshed(result) => self.on_refreshed(result),
        }
    }

    fn on_node_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Response { node, response } => {
                let id = response.opaque;
                let Some(attempt) = self.take_sent(id) else {
                    debug!(
                        opaque = id,
                        node = %node,
                        status = %response.status,
                        "dropping response for retired correlation id"
                    );
                    return;
                };
                trace!(id, node = %attempt.node, status = %response.status, "response");
                let outcome =
                    Outcome::classify(&attempt.command.operation, attempt.partition, &response);
                self.apply(attempt.command, outcome);
            }
            NodeEvent::Closed {
                node,
                generation,
                reason,
            } => {
                // Only requests known to have gone out on the dead connection
                // are lost. A send task that has not reported yet may well be
                // writing to a replacement; it is decided when it reports.
                let mut lost = Vec::new();
                for (id, entry) in &mut self.in_flight {
                    let Stage::Sent {
                        node: sent_to,
                        generation: acked,
                        closed,
                        ..
                    } = &mut entry.stage
                    else {
                        continue;
                    };
                    if *sent_to != node {
                        continue;
                    }
                    match acked {
                        Some(acked) if *acked == generation => lost.push(*id),
                        Some(_) => {}
                        None => closed.push(generation),
                    }
                }
                if lost.is_empty() {
                    return;
                }
                debug!(
                    node = %node,
                    generation,
                    commands = lost.len(),
                    %reason,
                    "connection lost with commands in flight"
                );
                for id in lost {
                    if let Some(attempt) = self.take_sent(id) {
                        self.apply(attempt.command, Outcome::ConnectionFault(reason.clone()));
                    }
                }
            }
        }
    }

    fn apply(&mut self, command: Command, outcome: Outcome) {
        if Instant::now() >= command.deadline {
            return self.time_out(command);
        }

        match outcome {
            Outcome::Success(reply) => self.finish(command, Ok(reply)),
            Outcome::ApplicationError(status) => {
                self.finish(command, Err(Error::Application(status)))
            }
            Outcome::RoutingStale { partition } => {
                if matches!(command.target, Target::Node(_)) {
                    return self.finish(command, Err(Error::NoRoute { partition }));
                }
                let Some(mut command) =
                    self.charge_retry(command, format!("stale route for partition {partition}"), false)
                else {
                    return;
                };
                debug!(id = command.id, partition, "node no longer owns partition");
                command.fastforward = true;
                self.park(command, Some(partition));
            }
            Outcome::TemporaryFailure => {
                if let Some(command) = self.charge_retry(command, "temporary failure".into(), false) {
                    self.back_off(command);
                }
            }
            Outcome::ConnectionFault(reason) => {
                if let Some(command) = self.charge_retry(command, reason, true) {
                    self.back_off(command);
                }
            }
        }
    }

    /// Counts one retry against the command. Returns it if it may go again;
    /// otherwise fails it and returns `None`.
    fn charge_retry(
        &mut self,
        mut command: Command,
        failure: String,
        connection_fault: bool,
    ) -> Option<Command> {
        command.retries += 1;
        if command.retries <= self.config.max_retries {
            command.last_failure = Some(failure);
            return Some(command);
        }
        warn!(
            id = command.id,
            kind = %command.operation.kind(),
            retries = self.config.max_retries,
            last = %failure,
            "retries exhausted"
        );
        let error = if connection_fault && matches!(command.target, Target::Node(_)) {
            Error::Connection(failure)
        } else {
            Error::RetriesExhausted {
                retries: self.config.max_retries,
                last: failure,
            }
        };
        self.finish(command, Err(error));
        None
    }

    fn back_off(&mut self, mut command: Command) {
        let delay = self.config.backoff(command.retries.saturating_sub(1));
        let until = (Instant::now() + delay).min(command.deadline);
        self.assign_id(&mut command);
        self.timers.push(Reverse((until, command.id)));
        debug!(
            id = command.id,
            retries = command.retries,
            ?delay,
            last = command.last_failure.as_deref().unwrap_or_default(),
            "retrying after backoff"
        );
        self.insert(
            command.id,
            InFlight {
                command,
                stage: Stage::Backoff { until },
            },
        );
    }

    fn park(&mut self, mut command: Command, partition: Option<u16>) {
        self.assign_id(&mut command);
        self.parked.push(command.id);
        self.insert(
            command.id,
            InFlight {
                command,
                stage: Stage::AwaitingTopology,
            },
        );
        self.request_refresh(partition);
    }

    /// Starts a refresh unless one is already running; parked commands all
    /// wait on the same one.
    fn request_refresh(&mut self, partition: Option<u16>) {
        if self.refresh_in_flight {
            trace!(?partition, "refresh already in flight");
            return;
        }
        self.refresh_in_flight = true;
        let refresher = Arc::clone(&self.refresher);
        let events = self.task_tx.clone();
        tokio::spawn(async move {
            let result = refresher.refresh(partition).await;
            let _ = events.send(TaskEvent::Refreshed(result));
        });
    }

    fn on_refreshed(&mut self, result: Result<Arc<TopologyTable>, TopologyError>) {
        self.refresh_in_flight = false;
        let parked = std::mem::take(&mut self.parked);
        for id in parked {
            // Commands that timed out while parked are already gone.
            let Some(InFlight { command, .. }) = self.remove(id) else {
                continue;
            };
            match &result {
                // A command that keeps hitting stale routes waits out a
                // backoff before each further attempt.
                Ok(_) if command.retries > 1 => self.back_off(command),
                Ok(_) => self.route(command),
                Err(error) => self.finish(command, Err(Error::from(error.clone()))),
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse((at, id))) = self.timers.peek() {
            if at > now {
                break;
            }
            self.timers.pop();

            let expired = match self.in_flight.get(&id) {
                None => continue,
                Some(entry) if now >= entry.command.deadline => true,
                Some(InFlight {
                    stage: Stage::Backoff { until },
                    ..
                }) if now >= *until => false,
                Some(_) => continue,
            };
            let Some(InFlight { command, .. }) = self.remove(id) else {
                continue;
            };
            if expired {
                self.time_out(command);
            } else {
                self.route(command);
            }
        }
    }

    /// Adds an entry, keeping the per-node counts in step.
    fn insert(&mut self, id: CorrelationId, entry: InFlight) {
        match &entry.stage {
            Stage::Sent { node, .. } => {
                *self.sent_per_node.entry(node.clone()).or_default() += 1;
            }
            Stage::Waiting { node, .. } => {
                self.waiting.entry(node.clone()).or_default().push_back(id);
                self.waiting_total += 1;
            }
            Stage::AwaitingTopology | Stage::Backoff { .. } => {}
        }
        self.in_flight.insert(id, entry);
    }

    /// Removes an entry, keeping the per-node counts in step.
    fn remove(&mut self, id: CorrelationId) -> Option<InFlight> {
        let entry = self.in_flight.remove(&id)?;
        match &entry.stage {
            Stage::Sent { node, .. } => {
                if let Some(count) = self.sent_per_node.get_mut(node) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.sent_per_node.remove(node);
                    }
                }
            }
            Stage::Waiting { node, .. } => {
                if let Some(queue) = self.waiting.get_mut(node) {
                    queue.retain(|&waiting| waiting != id);
                }
                self.waiting_total = self.waiting_total.saturating_sub(1);
            }
            Stage::AwaitingTopology | Stage::Backoff { .. } => {}
        }
        Some(entry)
    }

    fn take_sent(&mut self, id: CorrelationId) -> Option<SentAttempt> {
        if !matches!(
            self.in_flight.get(&id),
            Some(InFlight {
                stage: Stage::Sent { .. },
                ..
            })
        ) {
            return None;
        }
        match self.remove(id)? {
            InFlight {
                command,
                stage: Stage::Sent {
                    node, partition, ..
                },
            } => Some(SentAttempt {
                command,
                node,
                partition,
            }),
            _ => None,
        }
    }

    fn time_out(&mut self, command: Command) {
        let after = command.timeout;
        debug!(
            id = command.id,
            kind = %command.operation.kind(),
            retries = command.retries,
            last = command.last_failure.as_deref().unwrap_or_default(),
            "deadline exceeded"
        );
        self.finish(command, Err(Error::Timeout { after }));
    }

    fn finish(&mut self, mut command: Command, result: Result<Reply>) {
        match &result {
            Ok(reply) => trace!(id = command.id, cas = reply.cas(), "completed"),
            Err(error) => debug!(id = command.id, kind = %command.operation.kind(), %error, "failed"),
        }
        command.resolve(result);
    }

    fn shut_down(&mut self) {
        self.inbound.close();
        self.control.close();
        let mut failed = 0usize;
        while let Ok(mut command) = self.inbound.try_recv() {
            command.resolve(Err(Error::Shutdown));
            failed += 1;
        }
        while let Ok(done) = self.control.try_recv() {
            let _ = done.send(());
        }
        for (_, InFlight { mut command, .. }) in self.in_flight.drain() {
            command.resolve(Err(Error::Shutdown));
            failed += 1;
        }
        self.parked.clear();
        self.timers.clear();
        self.sent_per_node.clear();
        self.waiting.clear();
        self.waiting_total = 0;
        self.pool.close_all();
        info!(failed, "dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        command::Operation,
        connection::{EventSender, LinkState, NodeConnection},
        protocol::{Response, Status},
        refresher::TopologySource,
    };

    /// Answers every request with success, unless `silent`.
    struct EchoConnector {
        silent: bool,
    }

    struct EchoConnection {
        link: Arc<LinkState>,
        silent: bool,
    }

    #[async_trait]
    impl NodeConnection for EchoConnection {
        fn node(&self) -> &NodeId {
            self.link.node()
        }

        fn generation(&self) -> u64 {
            self.link.generation()
        }

        fn is_live(&self) -> bool {
            self.link.is_live()
        }

        async fn send(&self, request: Request) -> Result<(), ConnectionError> {
            if !self.silent {
                self.link.deliver(Response::success(request.opaque, 7));
            }
            Ok(())
        }

        fn close(&self) {
            self.link.shut("closed");
        }
    }

    #[async_trait]
    impl Connector for EchoConnector {
        async fn connect(
            &self,
            node: &NodeId,
            generation: u64,
            events: EventSender,
        ) -> Result<Arc<dyn NodeConnection>, ConnectionError> {
            Ok(Arc::new(EchoConnection {
                link: LinkState::new(node.clone(), generation, events),
                silent: self.silent,
            }))
        }
    }

    struct FixedSource;

    #[async_trait]
    impl TopologySource for FixedSource {
        async fn fetch_topology(&self, _bucket: &str) -> Result<TopologyTable, TopologyError> {
            Ok(TopologyTable::from_owners(1, &[NodeId::new("a:1")]))
        }
    }

    async fn dispatcher(silent: bool) -> (Dispatcher, Arc<TopologyRefresher>) {
        let refresher = Arc::new(TopologyRefresher::new(Arc::new(FixedSource), "default"));
        refresher.refresh(None).await.expect("bootstrap");
        let config = ClientConfig::default().with_topology_poll_interval(None);
        let (dispatcher, _worker) =
            Dispatcher::spawn(&config, Arc::clone(&refresher), Arc::new(EchoConnector { silent }));
        (dispatcher, refresher)
    }

    fn get(timeout: Duration) -> Command {
        Command::new(Operation::Get { key: b"k".to_vec() }, timeout)
    }

    #[tokio::test]
    async fn resolves_on_response() {
        let (dispatcher, _) = dispatcher(false).await;
        let result = dispatcher.submit(get(Duration::from_secs(1))).await.await;
        assert_eq!(
            result,
            Ok(Reply::Value {
                value: Vec::new(),
                flags: 0,
                cas: 7
            })
        );
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let (dispatcher, _) = dispatcher(true).await;
        let started = Instant::now();
        let result = dispatcher.submit(get(Duration::from_millis(80))).await.await;

        assert_eq!(
            result,
            Err(Error::Timeout {
                after: Duration::from_millis(80)
            })
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn shutdown_fails_in_flight_commands() {
        let (dispatcher, _) = dispatcher(true).await;
        let pending = dispatcher.submit(get(Duration::from_secs(30))).await;

        dispatcher.shutdown().await;
        assert_eq!(pending.await, Err(Error::Shutdown));
        assert!(dispatcher.is_closed());

        let late = dispatcher.submit(get(Duration::from_secs(1))).await;
        assert_eq!(late.await, Err(Error::Shutdown));
    }

    #[tokio::test]
    async fn commands_beyond_in_flight_limit_wait_their_turn() {
        let refresher = Arc::new(TopologyRefresher::new(Arc::new(FixedSource), "default"));
        refresher.refresh(None).await.expect("bootstrap");
        let config = ClientConfig {
            max_in_flight_per_node: 1,
            ..ClientConfig::default().with_topology_poll_interval(None)
        };
        let (dispatcher, _worker) =
            Dispatcher::spawn(&config, refresher, Arc::new(EchoConnector { silent: false }));

        let commands = (0..8).map(|_| get(Duration::from_secs(1))).collect();
        for pending in dispatcher.submit_multi(commands).await {
            assert!(pending.await.is_ok());
        }
    }

    #[tokio::test]
    async fn application_status_is_terminal() {
        struct Missing;

        #[async_trait]
        impl Connector for Missing {
            async fn connect(
                &self,
                node: &NodeId,
                generation: u64,
                events: EventSender,
            ) -> Result<Arc<dyn NodeConnection>, ConnectionError> {
                struct NotFound(Arc<LinkState>);

                #[async_trait]
                impl NodeConnection for NotFound {
                    fn node(&self) -> &NodeId {
                        self.0.node()
                    }
                    fn generation(&self) -> u64 {
                        self.0.generation()
                    }
                    fn is_live(&self) -> bool {
                        self.0.is_live()
                    }
                    async fn send(&self, request: Request) -> Result<(), ConnectionError> {
                        self.0.deliver(Response::new(request.opaque, Status::KeyNotFound));
                        Ok(())
                    }
                    fn close(&self) {
                        self.0.shut("closed");
                    }
                }

                Ok(Arc::new(NotFound(LinkState::new(node.clone(), generation, events))))
            }
        }

        let refresher = Arc::new(TopologyRefresher::new(Arc::new(FixedSource), "default"));
        refresher.refresh(None).await.expect("bootstrap");
        let (dispatcher, _worker) =
            Dispatcher::spawn(&ClientConfig::default(), refresher, Arc::new(Missing));

        let result = dispatcher.submit(get(Duration::from_secs(1))).await.await;
        assert!(result.expect_err("not found").is_not_found());
    }
}
