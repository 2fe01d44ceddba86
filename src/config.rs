//! Node and cluster configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one store node.
///
/// The initial peer address book comes from the external discovery
/// service; the consensus configuration only tracks node ids, so addresses
/// travel out of band (here, and in membership-change contexts).
#[derive(Clone)]
pub struct StoreConfig {
    /// This node's unique id. Must appear in `peers`.
    pub local_id: u64,

    /// Whether this node seeds a single-node cluster when it finds no
    /// existing consensus state on disk.
    pub bootstrap: bool,

    /// Initial id to address map for cluster members, including self.
    pub peers: HashMap<u64, String>,

    /// Election timeout in ticks (one tick per 100 ms).
    pub election_tick: usize,

    /// Leader heartbeat interval in ticks.
    pub heartbeat_tick: usize,

    /// How long a write may wait for its entry to commit and apply.
    pub commit_timeout: Duration,

    /// Bound on peer connection establishment, TLS handshake included.
    pub dial_timeout: Duration,

    /// Applied-entry count that triggers a snapshot and log compaction.
    /// Zero disables automatic compaction.
    pub snapshot_threshold: u64,

    /// Pre-validated TLS material for inbound consensus connections.
    pub server_tls: Option<Arc<rustls::ServerConfig>>,

    /// Pre-validated TLS material for dialing peers.
    pub peer_tls: Option<Arc<rustls::ClientConfig>>,
}

impl StoreConfig {
    pub fn new(local_id: u64) -> Self {
        Self {
            local_id,
            bootstrap: false,
            peers: HashMap::new(),
            election_tick: 10,
            heartbeat_tick: 3,
            commit_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(10),
            snapshot_threshold: 8192,
            server_tls: None,
            peer_tls: None,
        }
    }
}
