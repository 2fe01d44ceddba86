//! Adapter between the consensus runtime's storage interface and the
//! append-only commit log.
//!
//! The consensus library reads entries through [`raft::Storage`]; writes
//! (entry persistence, hard/conf state, snapshot installation, compaction)
//! come from the worker as it drains Ready state. Entries live in two
//! places: the durable commit log, and an in-memory tail cache that serves
//! reads and absorbs suffix rewinds after leadership changes. On open, the
//! cache is rebuilt by replaying the log; a record whose entry index
//! rewinds below the cached tail supersedes the conflicting suffix, so
//! replay converges on the same entries the cluster committed.
//!
//! A durable store additionally keeps two small files next to the log: a
//! stable file holding the latest hard and conf state, rewritten on every
//! change, and a snapshot file holding the most recent store checkpoint.
//! Together with log replay they let a restarted node recover its voter
//! configuration, term and full store content without leader help.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use prost::Message as ProstMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

use crate::commit_log::{CommitLog, Record};
use crate::error::StoreError;

const STABLE_FILE_NAME: &str = "stable";
const SNAPSHOT_FILE_NAME: &str = "snapshot";

struct LogCore<L> {
    log: L,
    /// Entries with index above the installed snapshot, in index order.
    entries: Vec<Entry>,
    hard_state: HardState,
    conf_state: ConfState,
    snapshot_meta: SnapshotMetadata,
    snapshot_data: Vec<u8>,
    /// Directory for the stable and snapshot files; `None` for an
    /// ephemeral store.
    state_dir: Option<PathBuf>,
}

impl<L: CommitLog> LogCore<L> {
    fn first_index(&self) -> u64 {
        self.snapshot_meta.index + 1
    }

    fn last_index(&self) -> u64 {
        self.snapshot_meta.index + self.entries.len() as u64
    }

    /// Rewrites the stable file with the current hard and conf state.
    fn persist_stable(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let mut buf = Vec::new();
        for frame in [
            self.hard_state.encode_to_vec(),
            self.conf_state.encode_to_vec(),
        ] {
            buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            buf.extend_from_slice(&frame);
        }
        write_file_atomic(&dir.join(STABLE_FILE_NAME), &buf)
    }

    /// Rewrites the snapshot file with the installed snapshot.
    fn persist_snapshot(&self) -> Result<(), StoreError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let mut snapshot = Snapshot::default();
        *snapshot.mut_metadata() = self.snapshot_meta.clone();
        snapshot.data = self.snapshot_data.clone().into();
        write_file_atomic(&dir.join(SNAPSHOT_FILE_NAME), &snapshot.encode_to_vec())
    }
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Shared-handle storage adapter. Cloning shares the same underlying
/// state, mirroring how the consensus node and the worker both hold it.
pub struct LogStore<L: CommitLog> {
    core: Arc<RwLock<LogCore<L>>>,
}

impl<L: CommitLog> Clone for LogStore<L> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<L: CommitLog> LogStore<L> {
    /// Wraps `log` without any stable or snapshot file. Hard and conf
    /// state live in memory only; used with
    /// [`MemLog`](crate::commit_log::MemLog) for ephemeral nodes and
    /// tests.
    pub fn new(log: L, initial_voters: Option<Vec<u64>>) -> Result<Self, StoreError> {
        Self::build(log, initial_voters, None)
    }

    /// Wraps `log` with the stable and snapshot files kept under
    /// `state_dir`, recovering whatever state a previous run left there.
    ///
    /// `initial_voters` seeds the configuration for a bootstrap node; it
    /// is ignored when any prior state is recovered. A joining node passes
    /// `None` and learns its configuration from the leader's log.
    pub fn durable(
        log: L,
        initial_voters: Option<Vec<u64>>,
        state_dir: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir.as_ref())?;
        Self::build(log, initial_voters, Some(state_dir.as_ref().to_path_buf()))
    }

    fn build(
        log: L,
        initial_voters: Option<Vec<u64>>,
        state_dir: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let mut hard_state = HardState::default();
        let mut conf_state = ConfState::default();
        let mut snapshot_meta = SnapshotMetadata::default();
        let mut snapshot_data = Vec::new();

        if let Some(dir) = &state_dir {
            if let Some(bytes) = read_file_opt(&dir.join(SNAPSHOT_FILE_NAME))? {
                let snapshot = Snapshot::decode(bytes.as_slice())
                    .map_err(|err| StoreError::Encoding(format!("snapshot file: {err}")))?;
                snapshot_meta = snapshot.get_metadata().clone();
                snapshot_data = snapshot.data.to_vec();
                conf_state = snapshot_meta.get_conf_state().clone();
                hard_state.term = snapshot_meta.term;
                hard_state.commit = snapshot_meta.index;
            }
            if let Some(bytes) = read_file_opt(&dir.join(STABLE_FILE_NAME))? {
                let (hs_bytes, cs_bytes) = split_stable_frames(&bytes)?;
                hard_state = HardState::decode(hs_bytes)
                    .map_err(|err| StoreError::Encoding(format!("stable file: {err}")))?;
                conf_state = ConfState::decode(cs_bytes)
                    .map_err(|err| StoreError::Encoding(format!("stable file: {err}")))?;
                hard_state.commit = hard_state.commit.max(snapshot_meta.index);
            }
        }

        let mut entries: Vec<Entry> = Vec::new();
        let (lowest, highest) = (log.lowest_offset(), log.highest_offset());
        for offset in lowest..=highest {
            let record = log.read(offset)?;
            let entry = Entry::decode(record.value.as_slice())
                .map_err(|err| StoreError::Encoding(format!("log record {offset}: {err}")))?;
            // A lower index after a higher one marks a superseded suffix;
            // the rewind applies even when the rewinding record itself is
            // covered by the snapshot.
            while entries
                .last()
                .is_some_and(|last: &Entry| last.index >= entry.index)
            {
                entries.pop();
            }
            if entry.index > snapshot_meta.index {
                entries.push(entry);
            }
        }

        // A compacted log with no snapshot file starts above index 1;
        // reconstruct the boundary from the first retained entry so the
        // index arithmetic stays consistent.
        if snapshot_meta.index == 0 {
            if let Some(first) = entries.first() {
                if first.index > 1 {
                    snapshot_meta.index = first.index - 1;
                    snapshot_meta.term = first.term;
                }
            }
        }

        let recovered =
            !entries.is_empty() || snapshot_meta.index > 0 || !conf_state.voters.is_empty();
        if !recovered {
            if let Some(voters) = initial_voters {
                conf_state.voters = voters;
            }
        }

        Ok(Self {
            core: Arc::new(RwLock::new(LogCore {
                log,
                entries,
                hard_state,
                conf_state,
                snapshot_meta,
                snapshot_data,
                state_dir,
            })),
        })
    }

    /// Persists `entries`, rewinding a conflicting cached suffix first.
    pub fn append(&self, entries: &[Entry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut core = self.core.write().unwrap();
        let first_new = entries[0].index;
        if first_new < core.first_index() {
            return Err(StoreError::Raft(format!(
                "appending compacted entry {first_new}"
            )));
        }
        let keep = (first_new - core.first_index()) as usize;
        core.entries.truncate(keep);
        for entry in entries {
            let record = Record::new(entry.encode_to_vec(), entry.term, entry.entry_type as u32);
            core.log.append(record)?;
            core.entries.push(entry.clone());
        }
        Ok(())
    }

    pub fn set_hard_state(&self, hs: HardState) -> Result<(), StoreError> {
        let mut core = self.core.write().unwrap();
        core.hard_state = hs;
        core.persist_stable()
    }

    pub fn set_commit(&self, commit: u64) -> Result<(), StoreError> {
        let mut core = self.core.write().unwrap();
        core.hard_state.commit = commit;
        core.persist_stable()
    }

    pub fn set_conf_state(&self, cs: ConfState) -> Result<(), StoreError> {
        let mut core = self.core.write().unwrap();
        core.conf_state = cs;
        core.persist_stable()
    }

    pub fn conf_state(&self) -> ConfState {
        self.core.read().unwrap().conf_state.clone()
    }

    pub fn first_index(&self) -> u64 {
        self.core.read().unwrap().first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.core.read().unwrap().last_index()
    }

    /// Index covered by the installed snapshot; the store content below it
    /// is only recoverable from the snapshot data.
    pub fn snapshot_index(&self) -> u64 {
        self.core.read().unwrap().snapshot_meta.index
    }

    /// Serialized store content of the installed snapshot. Empty when no
    /// snapshot has been taken.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.core.read().unwrap().snapshot_data.clone()
    }

    /// Installs a snapshot produced locally (leader-side compaction):
    /// records its metadata, then drops the now-redundant log prefix.
    pub fn install_snapshot(
        &self,
        index: u64,
        term: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut core = self.core.write().unwrap();
        if index <= core.snapshot_meta.index {
            return Ok(());
        }
        if index > core.last_index() {
            return Err(StoreError::Raft(format!(
                "snapshot index {index} beyond last log index {}",
                core.last_index()
            )));
        }

        let drop_count = (index + 1 - core.first_index()) as usize;
        core.entries.drain(..drop_count);

        core.snapshot_meta.index = index;
        core.snapshot_meta.term = term;
        core.snapshot_meta.set_conf_state(conf_state);
        core.snapshot_data = data;

        // The snapshot file lands before the log shrinks, so a crash in
        // between leaves a log whose redundant prefix is skipped on
        // replay, never a gap.
        core.persist_snapshot()?;

        // Drop the longest prefix of records whose entries the snapshot
        // covers. Superseded duplicates can sit behind higher-index
        // records after a leadership change, so each record's entry index
        // is checked rather than assuming offsets line up with indices.
        let mut cut = None;
        for offset in core.log.lowest_offset()..=core.log.highest_offset() {
            let record = core.log.read(offset)?;
            let entry = Entry::decode(record.value.as_slice())
                .map_err(|err| StoreError::Encoding(format!("log record {offset}: {err}")))?;
            if entry.index > index {
                break;
            }
            cut = Some(offset);
        }
        if let Some(cut) = cut {
            core.log.truncate(cut)?;
        }
        Ok(())
    }

    /// Installs a snapshot received from the leader (follower catch-up).
    /// The entire cached log is superseded by the snapshot's index.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut core = self.core.write().unwrap();
        let meta = snapshot.get_metadata();
        if meta.index < core.snapshot_meta.index {
            return Err(StoreError::Raft(format!(
                "snapshot index {} older than installed {}",
                meta.index, core.snapshot_meta.index
            )));
        }

        core.snapshot_meta = meta.clone();
        core.snapshot_data = snapshot.data.to_vec();
        core.conf_state = meta.get_conf_state().clone();
        core.hard_state.commit = core.hard_state.commit.max(meta.index);
        core.hard_state.term = core.hard_state.term.max(meta.term);
        core.entries.clear();

        core.persist_snapshot()?;
        core.persist_stable()?;

        let highest = core.log.highest_offset();
        core.log.truncate(highest)?;
        Ok(())
    }
}

fn read_file_opt(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::StorageIo(err)),
    }
}

/// Splits the stable file into its hard-state and conf-state frames.
fn split_stable_frames(bytes: &[u8]) -> Result<(&[u8], &[u8]), StoreError> {
    let mut frames = Vec::with_capacity(2);
    let mut rest = bytes;
    for _ in 0..2 {
        let (len_bytes, tail) = rest
            .split_at_checked(4)
            .ok_or_else(|| StoreError::Encoding("stable file truncated".to_string()))?;
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        let (frame, tail) = tail
            .split_at_checked(len)
            .ok_or_else(|| StoreError::Encoding("stable file truncated".to_string()))?;
        frames.push(frame);
        rest = tail;
    }
    Ok((frames[0], frames[1]))
}

impl<L: CommitLog> Storage for LogStore<L> {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core.read().unwrap();
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.core.read().unwrap();
        if low < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        let offset = core.first_index();
        let lo = (low - offset) as usize;
        let hi = (high - offset) as usize;
        let mut entries = core.entries[lo..hi].to_vec();

        if let Some(max_size) = max_size.into() {
            let mut size = 0u64;
            let mut keep = 0;
            for entry in &entries {
                size += entry.encoded_len() as u64;
                if size > max_size && keep > 0 {
                    break;
                }
                keep += 1;
            }
            entries.truncate(keep);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.core.read().unwrap();
        if idx == core.snapshot_meta.index {
            return Ok(core.snapshot_meta.term);
        }
        if idx < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > core.last_index() {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }
        Ok(core.entries[(idx - core.first_index()) as usize].term)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().unwrap().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.core.read().unwrap().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.core.read().unwrap();
        if core.snapshot_meta.index < request_index {
            // Nothing recent enough yet; the runtime retries after the
            // next compaction pass.
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        let mut snapshot = Snapshot::default();
        *snapshot.mut_metadata() = core.snapshot_meta.clone();
        // A peer that joined after the checkpoint must find itself in the
        // configuration it restores; the entries above the boundary follow
        // by ordinary replication.
        snapshot
            .mut_metadata()
            .set_conf_state(core.conf_state.clone());
        snapshot.data = core.snapshot_data.clone().into();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_log::{FileLog, MemLog};

    fn entry(index: u64, term: u64, payload: &[u8]) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry.data = payload.to_vec().into();
        entry
    }

    fn ctx() -> GetEntriesContext {
        GetEntriesContext::empty(false)
    }

    #[test]
    fn test_empty_store_bounds() {
        let store = LogStore::new(MemLog::new(), None).unwrap();
        assert_eq!(Storage::first_index(&store).unwrap(), 1);
        assert_eq!(Storage::last_index(&store).unwrap(), 0);
        assert_eq!(store.term(0).unwrap(), 0);
    }

    #[test]
    fn test_bootstrap_seeds_voters() {
        let store = LogStore::new(MemLog::new(), Some(vec![1])).unwrap();
        let state = store.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1]);
    }

    #[test]
    fn test_append_and_read_back() {
        let store = LogStore::new(MemLog::new(), None).unwrap();
        store
            .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")])
            .unwrap();

        assert_eq!(Storage::last_index(&store).unwrap(), 3);
        assert_eq!(store.term(3).unwrap(), 2);

        let got = store.entries(1, 4, None, ctx()).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].data.as_slice(), b"b");
    }

    #[test]
    fn test_append_rewinds_conflicting_suffix() {
        let store = LogStore::new(MemLog::new(), None).unwrap();
        store
            .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .unwrap();
        // A new leader overwrites indices 2..3 with term-2 entries.
        store.append(&[entry(2, 2, b"x"), entry(3, 2, b"y")]).unwrap();

        assert_eq!(Storage::last_index(&store).unwrap(), 3);
        assert_eq!(store.term(2).unwrap(), 2);
        let got = store.entries(2, 4, None, ctx()).unwrap();
        assert_eq!(got[0].data.as_slice(), b"x");
        assert_eq!(got[1].data.as_slice(), b"y");
    }

    #[test]
    fn test_recovery_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path()).unwrap();
            let store = LogStore::new(log, None).unwrap();
            store
                .append(&[entry(1, 1, b"a"), entry(2, 1, b"b")])
                .unwrap();
            store.append(&[entry(2, 2, b"x")]).unwrap();
        }
        let log = FileLog::open(dir.path()).unwrap();
        let store = LogStore::new(log, None).unwrap();
        assert_eq!(Storage::last_index(&store).unwrap(), 2);
        // The rewound record wins on replay.
        assert_eq!(store.term(2).unwrap(), 2);
        let got = store.entries(2, 3, None, ctx()).unwrap();
        assert_eq!(got[0].data.as_slice(), b"x");
    }

    #[test]
    fn test_install_snapshot_compacts() {
        let store = LogStore::new(MemLog::new(), Some(vec![1])).unwrap();
        store
            .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .unwrap();
        store
            .install_snapshot(2, 1, store.conf_state(), b"snap".to_vec())
            .unwrap();

        assert_eq!(Storage::first_index(&store).unwrap(), 3);
        assert_eq!(Storage::last_index(&store).unwrap(), 3);
        assert!(matches!(
            store.entries(1, 2, None, ctx()),
            Err(raft::Error::Store(StorageError::Compacted))
        ));
        assert_eq!(store.term(2).unwrap(), 1);

        let snapshot = store.snapshot(2, 0).unwrap();
        assert_eq!(snapshot.data.as_slice(), b"snap");
        assert_eq!(snapshot.get_metadata().index, 2);
    }

    #[test]
    fn test_snapshot_unavailable_before_compaction() {
        let store = LogStore::new(MemLog::new(), Some(vec![1])).unwrap();
        store.append(&[entry(1, 1, b"a")]).unwrap();
        assert!(matches!(
            store.snapshot(1, 0),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }

    #[test]
    fn test_apply_snapshot_resets_log() {
        let store = LogStore::new(MemLog::new(), None).unwrap();
        store.append(&[entry(1, 1, b"a"), entry(2, 1, b"b")]).unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 5;
        snapshot.mut_metadata().term = 3;
        snapshot.mut_metadata().mut_conf_state().voters = vec![1, 2];
        snapshot.data = b"state".to_vec().into();

        store.apply_snapshot(&snapshot).unwrap();
        assert_eq!(Storage::first_index(&store).unwrap(), 6);
        assert_eq!(Storage::last_index(&store).unwrap(), 5);
        assert_eq!(store.term(5).unwrap(), 3);
        assert_eq!(store.conf_state().voters, vec![1, 2]);
        let state = store.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 5);
    }

    #[test]
    fn test_durable_recovers_hard_and_conf_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path().join("log")).unwrap();
            let store = LogStore::durable(log, Some(vec![1]), dir.path()).unwrap();
            store.append(&[entry(1, 2, b"a")]).unwrap();
            let mut hs = HardState::default();
            hs.term = 2;
            hs.vote = 1;
            hs.commit = 1;
            store.set_hard_state(hs).unwrap();
            let mut cs = ConfState::default();
            cs.voters = vec![1, 2];
            store.set_conf_state(cs).unwrap();
        }
        let log = FileLog::open(dir.path().join("log")).unwrap();
        // The seed is ignored once prior state exists.
        let store = LogStore::durable(log, Some(vec![1]), dir.path()).unwrap();
        let state = store.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 2);
        assert_eq!(state.hard_state.vote, 1);
        assert_eq!(state.hard_state.commit, 1);
        assert_eq!(state.conf_state.voters, vec![1, 2]);
        assert_eq!(Storage::last_index(&store).unwrap(), 1);
    }

    #[test]
    fn test_durable_recovers_snapshot_after_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut cs = ConfState::default();
        cs.voters = vec![1];
        {
            let log = FileLog::open(dir.path().join("log")).unwrap();
            let store = LogStore::durable(log, Some(vec![1]), dir.path()).unwrap();
            store
                .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
                .unwrap();
            store
                .install_snapshot(2, 1, cs.clone(), b"checkpoint".to_vec())
                .unwrap();
        }
        let log = FileLog::open(dir.path().join("log")).unwrap();
        let store = LogStore::durable(log, None, dir.path()).unwrap();

        assert_eq!(store.snapshot_index(), 2);
        assert_eq!(store.snapshot_bytes(), b"checkpoint");
        assert_eq!(Storage::first_index(&store).unwrap(), 3);
        assert_eq!(Storage::last_index(&store).unwrap(), 3);
        assert_eq!(store.term(2).unwrap(), 1);
        let got = store.entries(3, 4, None, ctx()).unwrap();
        assert_eq!(got[0].data.as_slice(), b"c");
        // New appends continue where the log left off.
        store.append(&[entry(4, 2, b"d")]).unwrap();
        assert_eq!(Storage::last_index(&store).unwrap(), 4);
    }

    #[test]
    fn test_recovery_after_compaction_with_rewound_suffix() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = FileLog::open(dir.path().join("log")).unwrap();
            let store = LogStore::durable(log, Some(vec![1]), dir.path()).unwrap();
            store
                .append(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
                .unwrap();
            // A new leader rewinds indices 2..3, then a snapshot covers
            // index 1. The superseded records sit in the middle of the
            // durable log and must not confuse compaction or replay.
            store
                .append(&[entry(2, 2, b"x"), entry(3, 2, b"y")])
                .unwrap();
            store
                .install_snapshot(1, 1, store.conf_state(), b"snap".to_vec())
                .unwrap();
        }
        let log = FileLog::open(dir.path().join("log")).unwrap();
        let store = LogStore::durable(log, None, dir.path()).unwrap();

        assert_eq!(store.snapshot_index(), 1);
        assert_eq!(Storage::first_index(&store).unwrap(), 2);
        assert_eq!(Storage::last_index(&store).unwrap(), 3);
        assert_eq!(store.term(2).unwrap(), 2);
        let got = store.entries(2, 4, None, ctx()).unwrap();
        assert_eq!(got[0].data.as_slice(), b"x");
        assert_eq!(got[1].data.as_slice(), b"y");
    }

    #[test]
    fn test_compacted_log_without_snapshot_file_realigns() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = FileLog::open(dir.path()).unwrap();
            // Offsets 1..3 hold entries 4..6, as left behind by compaction.
            for idx in 4..=6 {
                log.append(Record::new(entry(idx, 2, b"x").encode_to_vec(), 2, 0))
                    .unwrap();
            }
        }
        let log = FileLog::open(dir.path()).unwrap();
        let store = LogStore::new(log, None).unwrap();
        assert_eq!(Storage::first_index(&store).unwrap(), 4);
        assert_eq!(Storage::last_index(&store).unwrap(), 6);
        assert_eq!(store.term(3).unwrap(), 2);
        assert_eq!(store.entries(4, 7, None, ctx()).unwrap().len(), 3);
    }
}
