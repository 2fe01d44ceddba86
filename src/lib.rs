//! Replicated, sharded, eviction-bounded key-value store.
//!
//! Each node holds a fixed-capacity cache: keys route to independent
//! shards, each a hash index plus a recency list that evicts its least
//! recently used entry when full. Raft consensus makes the cache durable
//! and fault-tolerant: writes are appended to a replicated log and applied
//! in commit order on every node, so all replicas converge to the same
//! content. Reads are served from the local store for latency, accepting
//! bounded staleness on followers.
//!
//! # Architecture
//!
//! - **Worker thread**: owns the consensus node; proposes writes, steps
//!   peer messages, applies committed entries. Single-threaded, since
//!   applies must happen one at a time in commit order.
//! - **Listener thread**: accepts tagged (optionally TLS) peer
//!   connections on the consensus port and forwards messages to the
//!   worker.
//! - **Caller threads**: block on commit futures with bounded timeouts
//!   for writes; read straight from the sharded store.
//!
//! Threads communicate over crossbeam channels, keeping all consensus
//! state under single ownership instead of locks.
//!
//! # Modules
//!
//! - [`store`]: the sharded eviction store
//! - [`distributed`]: the facade tying store, consensus and transport
//!   into one node
//! - [`fsm`]: applies committed operation records, produces and consumes
//!   snapshots
//! - [`command`]: tagged operation records replicated through the log
//! - [`log_store`]: consensus storage adapter over an append-only commit
//!   log
//! - [`commit_log`]: the durable record log boundary and implementations
//! - [`stream`]: tag-byte, optionally TLS, peer transport
//! - [`node`] / [`runtime`]: consensus node wrapper and its worker loop

pub mod command;
pub mod commit_log;
pub mod config;
pub mod distributed;
pub mod error;
pub mod fsm;
pub mod log_store;
pub mod node;
pub mod runtime;
pub mod store;
pub mod stream;
pub mod value;

pub use command::Operation;
pub use commit_log::{CommitLog, FileLog, MemLog, Record};
pub use config::StoreConfig;
pub use distributed::DistributedStore;
pub use error::StoreError;
pub use fsm::{ApplyOutcome, SnapshotSink, StoreMachine, StoreSnapshot};
pub use runtime::{NodeHandle, NodeStatus};
pub use store::{KeyValue, ShardedStore};
pub use stream::StreamLayer;
pub use value::Value;
