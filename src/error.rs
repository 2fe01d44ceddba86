//! Error taxonomy for the store and its consensus plumbing.
//!
//! Shard-local misses (`NoSuchKey`) are expected and recoverable. Consensus
//! errors (`NotLeader`, `CommitTimeout`) must reach the caller so it can
//! retry against the current leader; a write that looks successful but was
//! never committed would be a correctness violation. Storage I/O failures
//! are fatal to the node, which cannot safely continue without its log.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key is not present (or has been evicted).
    #[error("no such key")]
    NoSuchKey,

    /// A write was submitted to a node that is not the cluster leader.
    /// Retry against the current leader.
    #[error("not the cluster leader")]
    NotLeader,

    /// The commit deadline elapsed before the entry was applied.
    #[error("commit timed out after {0:?}")]
    CommitTimeout(Duration),

    /// No leader was observed within the deadline.
    #[error("no leader elected within {0:?}")]
    NoLeader(Duration),

    /// A commit-log read outside the retained offset range.
    #[error("offset out of range: {0}")]
    OffsetOutOfRange(u64),

    /// Malformed or unmarshalable operation payload. Fatal for the request
    /// that carried it, never silently dropped.
    #[error("encoding: {0}")]
    Encoding(String),

    /// Stream-layer failure: tag mismatch, TLS handshake, connection I/O.
    /// The consensus runtime treats the peer as unreachable and retries.
    #[error("transport: {0}")]
    Transport(String),

    /// Durable log or state failure. Fatal to the node.
    #[error("storage i/o: {0}")]
    StorageIo(#[from] io::Error),

    /// Consensus runtime error not covered by a more specific variant.
    #[error("consensus: {0}")]
    Raft(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The node's worker has shut down and no longer accepts requests.
    #[error("node is shut down")]
    Shutdown,
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Encoding(err.to_string())
    }
}

impl From<raft::Error> for StoreError {
    fn from(err: raft::Error) -> Self {
        match err {
            raft::Error::ProposalDropped => StoreError::NotLeader,
            other => StoreError::Raft(other.to_string()),
        }
    }
}
