//! Worker runtime and network plumbing for a store node.
//!
//! Threading model:
//!
//! - **Worker thread**: owns the consensus node, processes client
//!   requests, steps peer messages, drives the tick clock. Keeping the
//!   node single-threaded means commit-order application needs no locks
//!   and cannot be accidentally parallelized.
//! - **Listener thread**: accepts stream-layer connections and forwards
//!   decoded peer messages to the worker over a channel.
//! - **Connection handler threads**: short-lived, one per inbound
//!   connection, reading frames until the peer hangs up.
//!
//! Client calls block on a response channel with a bounded timeout, so the
//! commit wait is the only place a caller can stall, and never for longer
//! than the configured deadline. A timed-out caller walks away; its entry,
//! once proposed, may still commit and apply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use raft::StateRole;
use tracing::{error, info, warn};

use crate::command::Operation;
use crate::commit_log::CommitLog;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::fsm::ApplyOutcome;
use crate::node::{RaftNode, ReadyBundle};
use crate::stream::{read_frame, write_frame, StreamLayer};
use crate::value::Value;

/// The worker ticks the consensus clock at this cadence; election and
/// heartbeat timeouts are multiples of it.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// A point-in-time view of the node's consensus state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader_id: u64,
    pub term: u64,
}

/// Requests sent from callers to the worker thread. Most variants carry a
/// one-shot channel for the response.
enum ClientRequest {
    Apply {
        op: Operation,
        respond_to: Sender<ApplyOutcome>,
    },
    Join {
        id: u64,
        addr: String,
        respond_to: Sender<Result<(), StoreError>>,
    },
    Leave {
        id: u64,
        respond_to: Sender<Result<(), StoreError>>,
    },
    Status {
        respond_to: Sender<NodeStatus>,
    },
    Shutdown,
}

/// A membership change waiting for its configuration entry to commit.
/// `then_add` chains the add half of a remove-then-re-add join.
struct PendingConf {
    await_node: u64,
    then_add: Option<(u64, String)>,
    respond_to: Sender<Result<(), StoreError>>,
}

/// Handle for talking to a running worker. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    request_tx: Sender<ClientRequest>,
}

impl NodeHandle {
    /// Submits an operation through the consensus log and blocks until it
    /// commits and applies, or `timeout` elapses.
    pub fn apply(&self, op: Operation, timeout: Duration) -> Result<Option<Value>, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx
            .send(ClientRequest::Apply { op, respond_to: tx })
            .map_err(|_| StoreError::Shutdown)?;
        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::CommitTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Shutdown),
        }
    }

    pub fn join(&self, id: u64, addr: String, timeout: Duration) -> Result<(), StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx
            .send(ClientRequest::Join {
                id,
                addr,
                respond_to: tx,
            })
            .map_err(|_| StoreError::Shutdown)?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::CommitTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Shutdown),
        }
    }

    pub fn leave(&self, id: u64, timeout: Duration) -> Result<(), StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx
            .send(ClientRequest::Leave { id, respond_to: tx })
            .map_err(|_| StoreError::Shutdown)?;
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::CommitTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Shutdown),
        }
    }

    pub fn status(&self) -> Result<NodeStatus, StoreError> {
        let (tx, rx) = bounded(1);
        self.request_tx
            .send(ClientRequest::Status { respond_to: tx })
            .map_err(|_| StoreError::Shutdown)?;
        rx.recv().map_err(|_| StoreError::Shutdown)
    }

    /// Asks the worker to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(ClientRequest::Shutdown);
    }
}

pub(crate) struct SpawnedNode {
    pub handle: NodeHandle,
    pub worker: JoinHandle<()>,
    pub listener: JoinHandle<()>,
    pub shutdown: Arc<AtomicBool>,
}

/// Starts the listener and worker threads for `node`.
pub(crate) fn spawn_node<L: CommitLog>(
    node: RaftNode<L>,
    config: &StoreConfig,
    stream: Arc<StreamLayer>,
) -> Result<SpawnedNode, StoreError> {
    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let shutdown = Arc::new(AtomicBool::new(false));

    let listener = spawn_listener(Arc::clone(&stream), network_tx, Arc::clone(&shutdown))?;

    let local_id = config.local_id;
    let campaign_at_start = config.bootstrap;
    let mut worker = Worker {
        node,
        peers: config.peers.clone(),
        stream,
        client_rx,
        network_rx,
        dial_timeout: config.dial_timeout,
        pending_commits: HashMap::new(),
        pending_conf: Vec::new(),
        next_request_id: 1,
        last_role: StateRole::Follower,
    };

    let worker_handle = thread::Builder::new()
        .name(format!("shardkv-worker-{local_id}"))
        .spawn(move || {
            if campaign_at_start {
                if let Err(err) = worker.node.campaign() {
                    warn!(node = local_id, %err, "bootstrap campaign failed");
                }
            }
            if let Err(err) = worker.run() {
                error!(node = local_id, %err, "worker terminated");
            }
        })
        .map_err(StoreError::StorageIo)?;

    Ok(SpawnedNode {
        handle: NodeHandle {
            request_tx: client_tx,
        },
        worker: worker_handle,
        listener,
        shutdown,
    })
}

struct Worker<L: CommitLog> {
    node: RaftNode<L>,
    peers: HashMap<u64, String>,
    stream: Arc<StreamLayer>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Message>,
    dial_timeout: Duration,
    pending_commits: HashMap<u64, Sender<ApplyOutcome>>,
    pending_conf: Vec<PendingConf>,
    next_request_id: u64,
    last_role: StateRole,
}

impl<L: CommitLog> Worker<L> {
    /// The event loop: wait for a client request or peer message (bounded
    /// by the next tick), tick when due, then drain Ready state. A storage
    /// failure is fatal and ends the loop; the node cannot continue
    /// without its log.
    fn run(&mut self) -> Result<(), StoreError> {
        let mut last_tick = Instant::now();
        let result = loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req) {
                                break Ok(());
                            }
                        }
                        Err(_) => break Ok(()),
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => {
                            if let Err(err) = self.node.step(msg) {
                                warn!(node = self.node.id(), %err, "rejected peer message");
                            }
                        }
                        Err(_) => break Ok(()),
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                last_tick = Instant::now();
            }

            if let Err(err) = self.process_ready().and_then(|_| self.node.maybe_compact()) {
                break Err(err);
            }
            self.log_role_change();
        };

        // Whoever is still waiting learns the node is gone rather than
        // hanging until their timeout.
        for (_, tx) in self.pending_commits.drain() {
            let _ = tx.send(Err(StoreError::Shutdown));
        }
        for pending in self.pending_conf.drain(..) {
            let _ = pending.respond_to.send(Err(StoreError::Shutdown));
        }
        result
    }

    /// Returns `false` when shutdown was requested.
    fn handle_client_request(&mut self, req: ClientRequest) -> bool {
        match req {
            ClientRequest::Apply { op, respond_to } => {
                // The consensus library would forward a follower's proposal
                // to the leader; the write contract instead fails fast so
                // the caller can redirect with its own retry policy.
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(StoreError::NotLeader));
                    return true;
                }
                let request_id = self.next_request_id;
                self.next_request_id += 1;
                match self.node.propose(&op, request_id) {
                    Ok(()) => {
                        self.pending_commits.insert(request_id, respond_to);
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            ClientRequest::Join {
                id,
                addr,
                respond_to,
            } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(StoreError::NotLeader));
                    return true;
                }
                self.handle_join(id, addr, respond_to)
            }
            ClientRequest::Leave { id, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(StoreError::NotLeader));
                    return true;
                }
                match self.node.propose_remove_voter(id) {
                    Ok(()) => self.pending_conf.push(PendingConf {
                        await_node: id,
                        then_add: None,
                        respond_to,
                    }),
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(NodeStatus {
                    node_id: self.node.id(),
                    role: self.node.role(),
                    leader_id: self.node.leader_id(),
                    term: self.node.term(),
                });
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    /// Idempotent join: a voter already registered at this address is a
    /// no-op; a voter re-joining under a new address is removed first and
    /// re-added once the removal commits.
    fn handle_join(&mut self, id: u64, addr: String, respond_to: Sender<Result<(), StoreError>>) {
        let voters = self.node.voters();
        if voters.contains(&id) {
            if self.peers.get(&id) == Some(&addr) {
                let _ = respond_to.send(Ok(()));
                return;
            }
            self.peers.insert(id, addr.clone());
            match self.node.propose_remove_voter(id) {
                Ok(()) => self.pending_conf.push(PendingConf {
                    await_node: id,
                    then_add: Some((id, addr)),
                    respond_to,
                }),
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            }
            return;
        }

        self.peers.insert(id, addr.clone());
        match self.node.propose_add_voter(id, &addr) {
            Ok(()) => self.pending_conf.push(PendingConf {
                await_node: id,
                then_add: None,
                respond_to,
            }),
            Err(err) => {
                let _ = respond_to.send(Err(err));
            }
        }
    }

    /// Drains Ready bundles until the node is quiescent: dispatch
    /// messages, refresh the address book, resolve commit futures and
    /// pending membership changes.
    fn process_ready(&mut self) -> Result<(), StoreError> {
        while let Some(bundle) = self.node.poll_ready()? {
            let ReadyBundle {
                messages,
                applied,
                conf_changes,
            } = bundle;

            for msg in messages {
                self.dispatch_message(msg);
            }

            for op in applied {
                if op.origin != self.node.id() {
                    continue;
                }
                if let Some(tx) = self.pending_commits.remove(&op.request_id) {
                    let _ = tx.send(op.outcome);
                }
            }

            for conf in conf_changes {
                if let Some(addr) = &conf.addr {
                    self.peers.insert(conf.node_id, addr.clone());
                }
                info!(
                    node = self.node.id(),
                    peer = conf.node_id,
                    change = ?conf.change,
                    "membership change applied"
                );
                self.resolve_pending_conf(conf.node_id);
            }
        }
        Ok(())
    }

    fn resolve_pending_conf(&mut self, node_id: u64) {
        let Some(pos) = self
            .pending_conf
            .iter()
            .position(|pending| pending.await_node == node_id)
        else {
            return;
        };
        let pending = self.pending_conf.remove(pos);
        match pending.then_add {
            None => {
                let _ = pending.respond_to.send(Ok(()));
            }
            Some((id, addr)) => match self.node.propose_add_voter(id, &addr) {
                Ok(()) => self.pending_conf.push(PendingConf {
                    await_node: id,
                    then_add: None,
                    respond_to: pending.respond_to,
                }),
                Err(err) => {
                    let _ = pending.respond_to.send(Err(err));
                }
            },
        }
    }

    /// Sends a consensus message to its destination; messages addressed to
    /// this node feed straight back in. Delivery failures are logged and
    /// dropped, and the consensus protocol retries in its own time.
    fn dispatch_message(&mut self, msg: Message) {
        if msg.to == self.node.id() {
            if let Err(err) = self.node.step(msg) {
                warn!(node = self.node.id(), %err, "rejected local message");
            }
            return;
        }

        let to = msg.to;
        let Some(addr) = self.peers.get(&to) else {
            warn!(node = self.node.id(), peer = to, "no address for peer, dropping message");
            return;
        };
        if let Err(err) = send_message(&self.stream, addr, self.dial_timeout, &msg) {
            warn!(node = self.node.id(), peer = to, %err, "failed to send peer message");
        }
    }

    fn log_role_change(&mut self) {
        let current = self.node.role();
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                leader = self.node.leader_id(),
                "role changed"
            );
            self.last_role = current;
        }
    }
}

/// One connection per message keeps the transport stateless; consensus
/// traffic is sparse enough that connection setup cost does not matter
/// next to the commit round trip.
fn send_message(
    stream: &StreamLayer,
    addr: &str,
    timeout: Duration,
    msg: &Message,
) -> Result<(), StoreError> {
    let mut conn = stream.dial(addr, timeout)?;
    write_frame(&mut conn, &msg.encode_to_vec())
        .map_err(|err| StoreError::Transport(format!("send to {addr}: {err}")))?;
    Ok(())
}

/// Accepts consensus connections and forwards their messages to the
/// worker until the shutdown flag is raised.
fn spawn_listener(
    stream: Arc<StreamLayer>,
    tx: Sender<Message>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, StoreError> {
    let addr = stream
        .local_addr()
        .map_err(|err| StoreError::Transport(err.to_string()))?;
    thread::Builder::new()
        .name(format!("shardkv-listener-{addr}"))
        .spawn(move || loop {
            match stream.accept() {
                Ok(conn) => {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    let tx = tx.clone();
                    thread::spawn(move || {
                        if let Err(err) = handle_connection(conn, tx) {
                            warn!(%err, "peer connection error");
                        }
                    });
                }
                Err(err) => {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    warn!(%err, "rejected inbound connection");
                }
            }
        })
        .map_err(StoreError::StorageIo)
}

/// Reads framed messages until the peer closes the connection.
fn handle_connection(
    mut conn: impl std::io::Read,
    tx: Sender<Message>,
) -> Result<(), StoreError> {
    while let Some(frame) =
        read_frame(&mut conn).map_err(|err| StoreError::Transport(err.to_string()))?
    {
        let msg = Message::decode(frame.as_slice())
            .map_err(|err| StoreError::Encoding(format!("peer message: {err}")))?;
        if tx.send(msg).is_err() {
            // Worker is gone; drop the connection quietly.
            break;
        }
    }
    Ok(())
}
