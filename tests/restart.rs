//! Integration tests for durable recovery: a node restarted over the same
//! data directory must come back with its voter configuration, log and
//! store content intact, without any leader to catch up from.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use shardkv::{DistributedStore, StoreConfig, Value};

fn single_node_config(port: u16) -> StoreConfig {
    let mut config = StoreConfig::new(1);
    config.peers = HashMap::from([(1, format!("127.0.0.1:{port}"))]);
    config.bootstrap = true;
    config.commit_timeout = Duration::from_secs(5);
    config
}

/// Polls `condition` every 50 ms until it holds or `timeout` elapses.
fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_restart_recovers_log_and_store() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let mut store =
            DistributedStore::new(dir.path(), single_node_config(19701), 2, 32)?;
        store.wait_for_leader(Duration::from_secs(5))?;
        store.set("name", Value::from("ada"))?;
        store.set("count", Value::Int(3))?;
        store.close()?;
    }

    let mut store = DistributedStore::new(dir.path(), single_node_config(19701), 2, 32)?;
    store.wait_for_leader(Duration::from_secs(5))?;

    // Committed entries are re-applied from the recovered log.
    assert!(eventually(Duration::from_secs(3), || {
        store.get("name").map(|v| v == Value::from("ada")).unwrap_or(false)
            && store.get("count").map(|v| v == Value::Int(3)).unwrap_or(false)
    }));

    // The recovered node accepts new writes.
    store.set("after", Value::from("restart"))?;
    assert_eq!(store.get("after")?, Value::from("restart"));

    store.close()?;
    Ok(())
}

#[test]
fn test_restart_recovers_from_snapshot_after_compaction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = single_node_config(19711);
    // Compact aggressively so most of the state lives only in the
    // snapshot by the time the node goes down.
    config.snapshot_threshold = 4;

    {
        let mut store = DistributedStore::new(dir.path(), config.clone(), 2, 64)?;
        store.wait_for_leader(Duration::from_secs(5))?;
        for i in 0..10 {
            store.set(&format!("key-{i}"), Value::Int(i))?;
        }
        store.close()?;
    }

    let mut store = DistributedStore::new(dir.path(), config, 2, 64)?;
    store.wait_for_leader(Duration::from_secs(5))?;

    assert!(eventually(Duration::from_secs(3), || {
        (0..10).all(|i| {
            store
                .get(&format!("key-{i}"))
                .map(|v| v == Value::Int(i))
                .unwrap_or(false)
        })
    }));
    assert_eq!(store.keys().len(), 10);

    store.close()?;
    Ok(())
}
