//! The distributed storage facade.
//!
//! Wires the sharded store, the log store adapter, the stream layer and
//! the consensus worker into one node, and exposes the store contract to
//! protocol adapters: writes go through the replicated log, reads are
//! served from the local store.
//!
//! Reads bypassing consensus is a deliberate latency trade: a follower
//! may briefly serve state older than the leader's latest commit,
//! bounded by replication lag.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use std::io::Write;
use tracing::info;

use crate::command::Operation;
use crate::commit_log::{CommitLog, FileLog};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::fsm::StoreMachine;
use crate::log_store::LogStore;
use crate::node::RaftNode;
use crate::runtime::{spawn_node, NodeHandle, NodeStatus};
use crate::store::{KeyValue, ShardedStore};
use crate::stream::{StreamLayer, CONSENSUS_RPC_TAG};
use crate::value::Value;

/// Leader polling cadence for [`DistributedStore::wait_for_leader`].
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A replicated sharded store node.
///
/// The sharded store is shared between this facade's read path and the
/// worker's apply path; per-shard locking keeps both sides consistent
/// without any global lock.
pub struct DistributedStore {
    store: Arc<ShardedStore>,
    handle: NodeHandle,
    worker: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    listen_addr: String,
    commit_timeout: Duration,
}

impl DistributedStore {
    /// Builds a node with its consensus state kept under
    /// `<data_dir>/raft`: the commit log in `log/`, the stable file with
    /// hard and conf state, and the latest snapshot. A restarted node
    /// recovers its configuration and store content from these before it
    /// starts serving.
    pub fn new(
        data_dir: impl AsRef<Path>,
        config: StoreConfig,
        shard_count: usize,
        items_per_shard: usize,
    ) -> Result<Self, StoreError> {
        validate(&config, shard_count, items_per_shard)?;
        let raft_dir = data_dir.as_ref().join("raft");
        let log = FileLog::open(raft_dir.join("log"))?;
        let log_store = LogStore::durable(log, initial_voters(&config), &raft_dir)?;
        Self::build(log_store, config, shard_count, items_per_shard)
    }

    /// Builds a node over a caller-supplied commit log, with no stable or
    /// snapshot file. Used with [`MemLog`](crate::commit_log::MemLog) for
    /// ephemeral nodes and tests.
    pub fn with_log<L: CommitLog>(
        log: L,
        config: StoreConfig,
        shard_count: usize,
        items_per_shard: usize,
    ) -> Result<Self, StoreError> {
        validate(&config, shard_count, items_per_shard)?;
        let log_store = LogStore::new(log, initial_voters(&config))?;
        Self::build(log_store, config, shard_count, items_per_shard)
    }

    fn build<L: CommitLog>(
        log_store: LogStore<L>,
        config: StoreConfig,
        shard_count: usize,
        items_per_shard: usize,
    ) -> Result<Self, StoreError> {
        let listen_addr = config
            .peers
            .get(&config.local_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::Config(format!("local id {} missing from peers", config.local_id))
            })?;

        let store = Arc::new(ShardedStore::new(shard_count, items_per_shard));
        let fsm = StoreMachine::new(Arc::clone(&store));

        // Content below the snapshot boundary exists only in the
        // snapshot; replaying it rebuilds the store before any new apply.
        let snapshot = log_store.snapshot_bytes();
        if !snapshot.is_empty() {
            fsm.restore(snapshot.as_slice())?;
        }

        let node = RaftNode::new(&config, log_store, fsm)?;

        let listener = TcpListener::bind(&listen_addr)
            .map_err(|err| StoreError::Transport(format!("bind {listen_addr}: {err}")))?;
        let stream = Arc::new(StreamLayer::new(
            listener,
            config.server_tls.clone(),
            config.peer_tls.clone(),
        ));

        let commit_timeout = config.commit_timeout;
        let spawned = spawn_node(node, &config, stream)?;
        info!(node = config.local_id, addr = %listen_addr, "store node started");

        Ok(Self {
            store,
            handle: spawned.handle,
            worker: Some(spawned.worker),
            listener: Some(spawned.listener),
            shutdown: spawned.shutdown,
            listen_addr,
            commit_timeout,
        })
    }

    /// Replicates a write through the consensus log. Blocks until the
    /// entry commits and applies on this node, bounded by the commit
    /// timeout. Fails fast with [`StoreError::NotLeader`] on a non-leader.
    pub fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.handle
            .apply(
                Operation::Set {
                    key: key.to_string(),
                    value,
                },
                self.commit_timeout,
            )
            .map(|_| ())
    }

    /// Replicates a delete through the consensus log.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.handle
            .apply(
                Operation::Delete {
                    key: key.to_string(),
                },
                self.commit_timeout,
            )
            .map(|_| ())
    }

    /// Reads from the local store, bypassing consensus.
    pub fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.store.get(key)
    }

    /// Enumerates local keys, bypassing consensus.
    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Streams local `{key, value}` pairs into `sink`, bypassing
    /// consensus. The sink closes when the scan completes.
    pub fn stream_key_values(&self, sink: Sender<KeyValue>) {
        self.store.stream_key_values(sink)
    }

    /// Adds `id` as a voter at `addr`. Idempotent: joining again with the
    /// same address is a no-op, and a changed address re-registers the
    /// node. Must be called on the leader.
    pub fn join(&self, id: u64, addr: &str) -> Result<(), StoreError> {
        self.handle.join(id, addr.to_string(), self.commit_timeout)
    }

    /// Removes `id` from the voter configuration. Must be called on the
    /// leader.
    pub fn leave(&self, id: u64) -> Result<(), StoreError> {
        self.handle.leave(id, self.commit_timeout)
    }

    /// Polls until some node is observed as leader, or fails with
    /// [`StoreError::NoLeader`] after `timeout`.
    pub fn wait_for_leader(&self, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.handle.status()?.leader_id != 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::NoLeader(timeout));
            }
            std::thread::sleep(LEADER_POLL_INTERVAL);
        }
    }

    /// This node's current consensus status.
    pub fn status(&self) -> Result<NodeStatus, StoreError> {
        self.handle.status()
    }

    pub fn is_leader(&self) -> bool {
        self.handle
            .status()
            .map(|status| status.leader_id == status.node_id)
            .unwrap_or(false)
    }

    /// Gracefully shuts the node down: stops the worker, unblocks the
    /// listener, and joins both threads. Idempotent.
    pub fn close(&mut self) -> Result<(), StoreError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.handle.shutdown();
        self.shutdown.store(true, Ordering::Release);

        // The listener blocks in accept; a throwaway tagged connection
        // wakes it so it can observe the flag.
        if let Ok(mut conn) = TcpStream::connect(&self.listen_addr) {
            let _ = conn.write_all(&[CONSENSUS_RPC_TAG]);
        }

        worker
            .join()
            .map_err(|_| StoreError::Raft("worker thread panicked".to_string()))?;
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        Ok(())
    }
}

fn validate(
    config: &StoreConfig,
    shard_count: usize,
    items_per_shard: usize,
) -> Result<(), StoreError> {
    if shard_count < 1 || items_per_shard < 1 {
        return Err(StoreError::Config(
            "the store needs at least one shard and one item per shard".to_string(),
        ));
    }
    if !config.peers.contains_key(&config.local_id) {
        return Err(StoreError::Config(format!(
            "local id {} missing from peers",
            config.local_id
        )));
    }
    Ok(())
}

/// The single-voter seed for a bootstrap node. The log store ignores it
/// when any prior consensus state is recovered from disk.
fn initial_voters(config: &StoreConfig) -> Option<Vec<u64>> {
    config.bootstrap.then(|| vec![config.local_id])
}

impl Drop for DistributedStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
