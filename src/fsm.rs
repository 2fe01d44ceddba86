//! The replicated state machine adapter.
//!
//! Bridges committed log entries to the local [`ShardedStore`]. `apply` is
//! invoked once per committed entry, in commit order, on every replica;
//! given the same ordered operations, every replica's store converges to
//! the same content. That determinism is load-bearing and is why the
//! worker never parallelizes applies.

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::command::Operation;
use crate::error::StoreError;
use crate::store::{KeyValue, ShardedStore};
use crate::value::Value;

/// Result of applying one operation record: `Get` yields the value,
/// `Set`/`Delete` yield nothing. Errors travel back to the submitter
/// through its commit future; a failing apply never crashes the node.
pub type ApplyOutcome = Result<Option<Value>, StoreError>;

/// A durable destination for snapshot bytes. `cancel` discards a partially
/// written snapshot after an I/O failure.
pub trait SnapshotSink: Write {
    fn cancel(&mut self) -> io::Result<()>;
}

/// Applies operation records to the store and produces/consumes snapshots.
pub struct StoreMachine {
    store: Arc<ShardedStore>,
}

impl StoreMachine {
    pub fn new(store: Arc<ShardedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    /// Decodes the tagged operation record and dispatches it.
    pub fn apply(&self, data: &[u8]) -> ApplyOutcome {
        match Operation::decode(data)? {
            Operation::Set { key, value } => {
                self.store.set(&key, value);
                Ok(None)
            }
            Operation::Get { key } => self.store.get(&key).map(Some),
            Operation::Delete { key } => {
                self.store.delete(&key);
                Ok(None)
            }
        }
    }

    /// Serializes a full point-in-time scan of the store.
    ///
    /// Records are length-prefixed bincode `KeyValue` frames. Order is
    /// whatever the shard-parallel scan produced; restore is
    /// order-independent because replay goes through `set`.
    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.store.stream_key_values(tx);

        let mut data = Vec::new();
        for record in rx.iter() {
            let frame = bincode::serialize(&record)?;
            data.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            data.extend_from_slice(&frame);
        }
        Ok(StoreSnapshot { data })
    }

    /// Rebuilds the store from a serialized snapshot by feeding every
    /// record back through `set`. Runs before the node serves new applies;
    /// replaying the same snapshot twice is idempotent.
    pub fn restore<R: Read>(&self, mut reader: R) -> Result<(), StoreError> {
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(StoreError::StorageIo(err)),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            reader.read_exact(&mut frame).map_err(StoreError::StorageIo)?;
            let record: KeyValue = bincode::deserialize(&frame)?;
            self.store.set(&record.key, record.value);
        }
        Ok(())
    }
}

/// A serialized point-in-time copy of the store.
pub struct StoreSnapshot {
    data: Vec<u8>,
}

impl StoreSnapshot {
    /// Copies the serialized bytes into `sink`, canceling the sink on any
    /// I/O error so a torn snapshot is never retained.
    pub fn persist<S: SnapshotSink>(&self, sink: &mut S) -> Result<(), StoreError> {
        if let Err(err) = sink.write_all(&self.data).and_then(|_| sink.flush()) {
            let _ = sink.cancel();
            return Err(StoreError::StorageIo(err));
        }
        Ok(())
    }

    /// No resources are held beyond the buffer.
    pub fn release(self) {}

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(shards: usize, per_shard: usize) -> StoreMachine {
        StoreMachine::new(Arc::new(ShardedStore::new(shards, per_shard)))
    }

    #[test]
    fn test_apply_set_then_get() {
        let fsm = machine(2, 8);
        let set = Operation::Set {
            key: "k".into(),
            value: Value::Str("v".into()),
        }
        .encode()
        .unwrap();
        assert_eq!(fsm.apply(&set).unwrap(), None);

        let get = Operation::Get { key: "k".into() }.encode().unwrap();
        assert_eq!(fsm.apply(&get).unwrap(), Some(Value::Str("v".into())));
    }

    #[test]
    fn test_apply_get_missing_key() {
        let fsm = machine(2, 8);
        let get = Operation::Get { key: "nope".into() }.encode().unwrap();
        assert!(matches!(fsm.apply(&get), Err(StoreError::NoSuchKey)));
    }

    #[test]
    fn test_apply_delete() {
        let fsm = machine(2, 8);
        let set = Operation::Set {
            key: "k".into(),
            value: Value::Int(1),
        }
        .encode()
        .unwrap();
        fsm.apply(&set).unwrap();

        let del = Operation::Delete { key: "k".into() }.encode().unwrap();
        assert_eq!(fsm.apply(&del).unwrap(), None);
        assert!(fsm.store().is_empty());
        // Deleting an absent key applies cleanly.
        assert_eq!(fsm.apply(&del).unwrap(), None);
    }

    #[test]
    fn test_apply_rejects_garbage() {
        let fsm = machine(2, 8);
        assert!(matches!(
            fsm.apply(&[0, 1, 2, 3]),
            Err(StoreError::Encoding(_))
        ));
        assert!(matches!(fsm.apply(&[]), Err(StoreError::Encoding(_))));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let source = machine(3, 8);
        for i in 0..10 {
            source.store().set(&format!("key-{i}"), Value::Int(i));
        }
        source.store().set("name", Value::Str("ada".into()));

        let snapshot = source.snapshot().unwrap();
        let target = machine(3, 8);
        target.restore(snapshot.as_bytes()).unwrap();

        let mut want = source.store().keys();
        let mut got = target.store().keys();
        want.sort();
        got.sort();
        assert_eq!(got, want);
        for key in want {
            assert_eq!(
                target.store().get(&key).unwrap(),
                source.store().get(&key).unwrap()
            );
        }
    }

    #[test]
    fn test_restore_is_idempotent() {
        let source = machine(2, 8);
        source.store().set("a", Value::Int(1));
        source.store().set("b", Value::Int(2));
        let snapshot = source.snapshot().unwrap();

        let target = machine(2, 8);
        target.restore(snapshot.as_bytes()).unwrap();
        target.restore(snapshot.as_bytes()).unwrap();
        assert_eq!(target.store().len(), 2);
        assert_eq!(target.store().get("a").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_empty_snapshot() {
        let fsm = machine(2, 8);
        let snapshot = fsm.snapshot().unwrap();
        assert!(snapshot.as_bytes().is_empty());
        let target = machine(2, 8);
        target.restore(snapshot.as_bytes()).unwrap();
        assert!(target.store().is_empty());
    }

    #[test]
    fn test_restore_rejects_truncated_frame() {
        let fsm = machine(2, 8);
        // Claims an 8-byte frame but carries only 2 bytes.
        let bogus = [0u8, 0, 0, 8, 1, 2];
        assert!(matches!(
            fsm.restore(&bogus[..]),
            Err(StoreError::StorageIo(_))
        ));
    }

    struct FailingSink {
        canceled: bool,
    }

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for FailingSink {
        fn cancel(&mut self) -> io::Result<()> {
            self.canceled = true;
            Ok(())
        }
    }

    #[test]
    fn test_persist_cancels_sink_on_error() {
        let fsm = machine(2, 8);
        fsm.store().set("k", Value::Int(1));
        let snapshot = fsm.snapshot().unwrap();

        let mut sink = FailingSink { canceled: false };
        assert!(snapshot.persist(&mut sink).is_err());
        assert!(sink.canceled);
    }

    struct VecSink {
        buf: Vec<u8>,
    }

    impl Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SnapshotSink for VecSink {
        fn cancel(&mut self) -> io::Result<()> {
            self.buf.clear();
            Ok(())
        }
    }

    #[test]
    fn test_persist_copies_all_bytes() {
        let fsm = machine(2, 8);
        fsm.store().set("k", Value::Str("v".into()));
        let snapshot = fsm.snapshot().unwrap();

        let mut sink = VecSink { buf: Vec::new() };
        snapshot.persist(&mut sink).unwrap();
        assert_eq!(sink.buf, snapshot.as_bytes());
        snapshot.release();
    }
}
