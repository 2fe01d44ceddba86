//! Sharded, capacity-bounded key-value store with recency eviction.
//!
//! Keys are routed to a fixed array of shards by a deterministic hash.
//! Each shard owns an independent `RwLock` over a hash index plus a
//! doubly linked recency list bounded at `items_per_shard` entries, so
//! operations on different shards proceed fully in parallel and eviction
//! stays local to a shard. That trades perfect global LRU ordering for
//! lock-free cross-shard parallelism.
//!
//! The recency list is an arena: slots addressed by index, with `prev`/
//! `next` stored as indices and a free list of vacated slots. Unlink and
//! relink stay O(1) without reference-counted pointer cycles.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::thread;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::value::Value;

/// Routing only looks at a bounded key prefix, so pathological key lengths
/// cannot slow down shard selection.
const MAX_HASHED_KEY_LEN: usize = 100;

/// Sentinel index for "no slot".
const NIL: usize = usize::MAX;

/// One key-value pair emitted by [`ShardedStore::stream_key_values`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

#[derive(Debug)]
struct Slot {
    key: String,
    value: Value,
    prev: usize,
    next: usize,
}

/// Doubly linked recency list over an arena of slots.
///
/// Head is most recently used; the tail is the eviction victim. Every
/// mutation happens under the owning shard's write lock.
#[derive(Debug)]
struct EvictList {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl EvictList {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn value(&self, idx: usize) -> &Value {
        &self.slots[idx].value
    }

    /// Allocates a slot (reusing a vacated one if available) and links it
    /// at the head. Returns the slot index.
    fn insert_front(&mut self, key: String, value: Value) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.key = key;
                slot.value = value;
                idx
            }
            None => {
                self.slots.push(Slot {
                    key,
                    value,
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        self.link_front(idx);
        idx
    }

    /// Detaches a live slot and relinks it at the head (recency bump).
    fn move_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    /// Detaches a live slot and returns it to the free list.
    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        self.free.push(idx);
    }

    /// Evicts the tail slot, returning its key so the index entry can be
    /// removed as well.
    fn pop_back(&mut self) -> Option<String> {
        if self.tail == NIL {
            return None;
        }
        let idx = self.tail;
        self.unlink(idx);
        self.free.push(idx);
        Some(std::mem::take(&mut self.slots[idx].key))
    }

    fn link_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
        self.len += 1;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
        self.len -= 1;
    }
}

/// Index and recency list mutate together; the shard lock keeps them in
/// sync. Every key in `index` points at exactly one live list slot.
#[derive(Debug)]
struct ShardState {
    index: HashMap<String, usize>,
    list: EvictList,
}

type Shard = RwLock<ShardState>;

/// The sharded store shared by the local read path and the replicated
/// apply path. A key maps to the same shard for the lifetime of the store.
#[derive(Debug)]
pub struct ShardedStore {
    shards: Vec<Shard>,
    items_per_shard: usize,
}

impl ShardedStore {
    /// Creates a store with `shard_count` shards of `items_per_shard`
    /// capacity each. Total capacity is the product of the two.
    pub fn new(shard_count: usize, items_per_shard: usize) -> Self {
        let shards = (0..shard_count)
            .map(|_| {
                RwLock::new(ShardState {
                    index: HashMap::new(),
                    list: EvictList::new(),
                })
            })
            .collect();
        Self {
            shards,
            items_per_shard,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn items_per_shard(&self) -> usize {
        self.items_per_shard
    }

    /// Polynomial rolling hash over the key's characters.
    ///
    /// Deliberately not `DefaultHasher`: routing must be stable for the
    /// lifetime of the store and identical on every replica, and the
    /// standard hasher is randomly seeded per process.
    fn shard_index(&self, key: &str) -> usize {
        let n = self.shards.len();
        let mut total = 0usize;
        for ch in key.chars().take(MAX_HASHED_KEY_LEN) {
            total = (total.wrapping_mul(31) + ch as usize) % n;
        }
        total
    }

    fn shard_for(&self, key: &str) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Inserts or replaces `key`, leaving it at the most-recently-used
    /// position. If the insert pushes the shard over capacity the least
    /// recently used entry is evicted.
    ///
    /// An existing key is fully deleted first, so re-setting never
    /// duplicates an entry and capacity accounting stays exact.
    pub fn set(&self, key: &str, value: Value) {
        let shard = self.shard_for(key);

        let exists = shard.read().unwrap().index.contains_key(key);
        if exists {
            // Reuse the resolved shard handle instead of re-hashing.
            Self::delete_in_shard(shard, key);
        }

        let mut state = shard.write().unwrap();
        let ShardState { index, list } = &mut *state;
        // The key may have reappeared between the delete and this lock.
        if let Some(prior) = index.remove(key) {
            list.remove(prior);
        }
        let idx = list.insert_front(key.to_string(), value);
        index.insert(key.to_string(), idx);
        if list.len() > self.items_per_shard {
            if let Some(evicted) = list.pop_back() {
                index.remove(&evicted);
            }
        }
    }

    /// Returns the value for `key`, bumping it to the most-recently-used
    /// position. Fails with [`StoreError::NoSuchKey`] when absent.
    pub fn get(&self, key: &str) -> Result<Value, StoreError> {
        let shard = self.shard_for(key);

        {
            let state = shard.read().unwrap();
            if !state.index.contains_key(key) {
                return Err(StoreError::NoSuchKey);
            }
        }

        let mut state = shard.write().unwrap();
        // Re-check: the key may have been deleted or evicted between locks.
        let Some(&idx) = state.index.get(key) else {
            return Err(StoreError::NoSuchKey);
        };
        state.list.move_front(idx);
        Ok(state.list.value(idx).clone())
    }

    /// Removes `key` from both index and list. Deleting an absent key is a
    /// no-op, not an error.
    pub fn delete(&self, key: &str) {
        Self::delete_in_shard(self.shard_for(key), key);
    }

    fn delete_in_shard(shard: &Shard, key: &str) {
        let mut state = shard.write().unwrap();
        let ShardState { index, list } = &mut *state;
        if let Some(idx) = index.remove(key) {
            list.remove(idx);
        }
    }

    /// Collects every key with one scan thread per shard, appending into a
    /// shared result under a dedicated aggregation lock. All scans join
    /// before returning; order is unspecified.
    ///
    /// Each shard's view is consistent under its read lock, but a key
    /// written while the scan runs may or may not appear.
    pub fn keys(&self) -> Vec<String> {
        let keys = Mutex::new(Vec::new());
        thread::scope(|scope| {
            for shard in &self.shards {
                let keys = &keys;
                scope.spawn(move || {
                    let state = shard.read().unwrap();
                    let mut collected: Vec<String> = state.index.keys().cloned().collect();
                    keys.lock().unwrap().append(&mut collected);
                });
            }
        });
        keys.into_inner().unwrap()
    }

    /// Pushes every `{key, value}` pair into `sink` with the same scatter
    /// pattern as [`keys`](Self::keys). The channel closes once every
    /// shard scan has completed. Finite, single pass, not restartable.
    pub fn stream_key_values(&self, sink: Sender<KeyValue>) {
        thread::scope(|scope| {
            for shard in &self.shards {
                let sink = sink.clone();
                scope.spawn(move || {
                    let state = shard.read().unwrap();
                    for (key, &idx) in &state.index {
                        let _ = sink.send(KeyValue {
                            key: key.clone(),
                            value: state.list.value(idx).clone(),
                        });
                    }
                });
            }
        });
    }

    /// Total entry count across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap().list.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
