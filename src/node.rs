//! The consensus node: a thin shell around the raft `RawNode` that wires
//! its storage to the log store adapter and its applies to the store
//! machine.
//!
//! The wrapper exposes a simplified surface (`propose`, `step`, `tick`,
//! `poll_ready`) and keeps the two-phase Ready/LightReady drain in one
//! place so the worker's event loop stays linear.

use prost::Message as ProstMessage;
use raft::prelude::{ConfChange, ConfChangeType, ConfChangeV2, Entry, EntryType, Message};
use raft::{Config as RaftConfig, RawNode, StateRole};
use slog::{o, Logger};

use crate::command::Operation;
use crate::commit_log::CommitLog;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::fsm::{ApplyOutcome, StoreMachine};
use crate::log_store::LogStore;

/// The consensus library demands a logger; raft internals are reported
/// through this crate's own tracing events instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// A committed operation applied to the local store. `origin` and
/// `request_id` echo the proposing node's entry context so the worker can
/// resolve exactly the commit future that is waiting on it.
pub struct AppliedOp {
    pub origin: u64,
    pub request_id: u64,
    pub index: u64,
    pub outcome: ApplyOutcome,
}

/// A committed membership change. `addr` carries the joining node's
/// address so every replica's address book stays current.
pub struct ConfApplied {
    pub node_id: u64,
    pub change: ConfChangeType,
    pub addr: Option<String>,
}

/// Everything one Ready drain produced: messages to dispatch, operations
/// applied, membership changes applied.
#[derive(Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<AppliedOp>,
    pub conf_changes: Vec<ConfApplied>,
}

pub struct RaftNode<L: CommitLog> {
    id: u64,
    raw: RawNode<LogStore<L>>,
    log_store: LogStore<L>,
    fsm: StoreMachine,
    snapshot_threshold: u64,
    last_applied: u64,
    applied_since_snapshot: u64,
}

impl<L: CommitLog> RaftNode<L> {
    pub fn new(
        config: &StoreConfig,
        log_store: LogStore<L>,
        fsm: StoreMachine,
    ) -> Result<Self, StoreError> {
        let raft_config = RaftConfig {
            id: config.local_id,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            max_inflight_msgs: 256,
            // On restart the store below the snapshot boundary is rebuilt
            // from snapshot data, not by re-applying compacted entries.
            applied: log_store.snapshot_index(),
            // A removed node that keeps ticking must not be able to
            // disrupt the remaining cluster with inflated terms.
            pre_vote: true,
            check_quorum: true,
            ..Default::default()
        };
        let raw = RawNode::new(&raft_config, log_store.clone(), &silent_logger())
            .map_err(StoreError::from)?;
        let last_applied = log_store.snapshot_index();
        Ok(Self {
            id: config.local_id,
            raw,
            log_store,
            fsm,
            snapshot_threshold: config.snapshot_threshold,
            last_applied,
            applied_since_snapshot: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn voters(&self) -> Vec<u64> {
        self.log_store.conf_state().voters
    }

    /// Drives the logical clock; timeouts are measured in ticks.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election. Used by the bootstrap node at startup so a
    /// single-voter cluster elects itself without waiting out a timeout.
    pub fn campaign(&mut self) -> Result<(), StoreError> {
        self.raw.campaign().map_err(StoreError::from)
    }

    /// Feeds a peer message into the state machine.
    pub fn step(&mut self, msg: Message) -> Result<(), StoreError> {
        self.raw.step(msg).map_err(StoreError::from)
    }

    /// Proposes an operation record for replication. The entry context
    /// carries `(origin, request_id)` so the commit can be matched back to
    /// its caller. Fails with [`StoreError::NotLeader`] on a non-leader.
    pub fn propose(&mut self, op: &Operation, request_id: u64) -> Result<(), StoreError> {
        let data = op.encode()?;
        let mut context = Vec::with_capacity(16);
        context.extend_from_slice(&self.id.to_be_bytes());
        context.extend_from_slice(&request_id.to_be_bytes());
        self.raw.propose(context, data).map_err(StoreError::from)
    }

    /// Proposes adding `node_id` as a voter; the context carries its
    /// address for replication into every peer's address book.
    pub fn propose_add_voter(&mut self, node_id: u64, addr: &str) -> Result<(), StoreError> {
        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::AddNode);
        change.node_id = node_id;
        change.context = addr.as_bytes().to_vec().into();
        self.raw
            .propose_conf_change(Vec::new(), change)
            .map_err(StoreError::from)
    }

    pub fn propose_remove_voter(&mut self, node_id: u64) -> Result<(), StoreError> {
        let mut change = ConfChange::default();
        change.set_change_type(ConfChangeType::RemoveNode);
        change.node_id = node_id;
        self.raw
            .propose_conf_change(Vec::new(), change)
            .map_err(StoreError::from)
    }

    /// Drains all pending Ready state.
    ///
    /// Phase one persists what must be durable (snapshot, hard state, new
    /// entries) and applies committed entries; phase two (LightReady)
    /// picks up the commit index advance and whatever committed behind it.
    /// Returns `None` when the state machine is quiescent.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>, StoreError> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut bundle = ReadyBundle::default();

        if !ready.snapshot().is_empty() {
            // A state transfer from the leader: rebuild the store, then
            // reset the log to the snapshot's index.
            let snapshot = ready.snapshot().clone();
            self.fsm.restore::<&[u8]>(snapshot.data.as_ref())?;
            self.log_store.apply_snapshot(&snapshot)?;
            self.last_applied = snapshot.get_metadata().index;
        }

        if let Some(hard_state) = ready.hs() {
            self.log_store.set_hard_state(hard_state.clone())?;
        }

        if !ready.entries().is_empty() {
            self.log_store.append(ready.entries())?;
        }

        self.apply_committed(ready.take_committed_entries(), &mut bundle)?;
        bundle.messages.extend(ready.take_messages());
        bundle.messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.log_store.set_commit(commit)?;
        }
        self.apply_committed(light_ready.take_committed_entries(), &mut bundle)?;
        bundle.messages.extend(light_ready.take_messages());

        self.raw.advance_apply();

        Ok(Some(bundle))
    }

    fn apply_committed(
        &mut self,
        entries: Vec<Entry>,
        bundle: &mut ReadyBundle,
    ) -> Result<(), StoreError> {
        for entry in entries {
            self.last_applied = entry.index;
            match entry.entry_type() {
                EntryType::EntryNormal => {
                    // Empty entries are leader no-ops emitted on election.
                    if entry.data.is_empty() {
                        continue;
                    }
                    let outcome = self.fsm.apply(&entry.data);
                    let (origin, request_id) = decode_context(&entry.context);
                    bundle.applied.push(AppliedOp {
                        origin,
                        request_id,
                        index: entry.index,
                        outcome,
                    });
                    self.applied_since_snapshot += 1;
                }
                EntryType::EntryConfChange => {
                    let change = ConfChange::decode(entry.data.as_ref())
                        .map_err(|err| StoreError::Encoding(err.to_string()))?;
                    let conf_state = self
                        .raw
                        .apply_conf_change(&change)
                        .map_err(StoreError::from)?;
                    self.log_store.set_conf_state(conf_state)?;
                    let addr = if change.context.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&change.context).into_owned())
                    };
                    bundle.conf_changes.push(ConfApplied {
                        node_id: change.node_id,
                        change: change.change_type(),
                        addr,
                    });
                }
                EntryType::EntryConfChangeV2 => {
                    let change = ConfChangeV2::decode(entry.data.as_ref())
                        .map_err(|err| StoreError::Encoding(err.to_string()))?;
                    let conf_state = self
                        .raw
                        .apply_conf_change(&change)
                        .map_err(StoreError::from)?;
                    self.log_store.set_conf_state(conf_state)?;
                }
            }
        }
        Ok(())
    }

    /// Once enough entries have been applied since the last checkpoint,
    /// serializes the store, installs it as the log store's snapshot and
    /// compacts the log prefix it covers.
    pub fn maybe_compact(&mut self) -> Result<(), StoreError> {
        if self.snapshot_threshold == 0 || self.applied_since_snapshot < self.snapshot_threshold {
            return Ok(());
        }
        let applied = self.last_applied;
        let term = raft::Storage::term(&self.log_store, applied).map_err(StoreError::from)?;
        let data = self.fsm.snapshot()?.into_bytes();
        self.log_store
            .install_snapshot(applied, term, self.log_store.conf_state(), data)?;
        self.applied_since_snapshot = 0;
        tracing::info!(node = self.id, index = applied, "compacted log after snapshot");
        Ok(())
    }
}

fn decode_context(context: &[u8]) -> (u64, u64) {
    if context.len() != 16 {
        return (0, 0);
    }
    let mut origin = [0u8; 8];
    let mut request = [0u8; 8];
    origin.copy_from_slice(&context[..8]);
    request.copy_from_slice(&context[8..]);
    (u64::from_be_bytes(origin), u64::from_be_bytes(request))
}
