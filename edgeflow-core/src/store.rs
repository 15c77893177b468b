//! Durable checkpoint storage.
//!
//! The checkpoint core never inspects persisted bytes; it only needs the
//! narrow [`Store`] contract: persist per-operator snapshots, record
//! completed checkpoint ids, and occasionally compact. Two implementations
//! are provided: an in-memory store for tests and at-most-once rules, and a
//! filesystem store for durable rules.

use crate::types::{CheckpointId, Qos};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

/// A staged copy of one operator's key/value state.
pub type StateSnapshot = HashMap<String, Vec<u8>>;

/// Number of completed checkpoints retained by the durable layer; matches
/// the coordinator's in-memory retention.
const RETAINED_CHECKPOINTS: usize = 3;

/// Durable persistence consumed by the checkpoint coordinator and the
/// per-operator contexts.
pub trait Store: Send + Sync {
    /// Persist one operator's staged snapshot under a checkpoint id.
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        snapshot: &StateSnapshot,
    ) -> Result<()>;

    /// Record a checkpoint as fully completed.
    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()>;

    /// Compact old persisted data. Called at a throttled cadence.
    fn clean(&self) -> Result<()>;
}

/// Create the store for a rule. At-most-once rules never persist, so they
/// get the in-memory store; everything else goes to the filesystem under
/// `EDGEFLOW_STATE_DIR` (or the system temp dir).
pub fn create_store(name: &str, qos: Qos) -> Result<std::sync::Arc<dyn Store>> {
    if qos == Qos::AtMostOnce {
        Ok(std::sync::Arc::new(InMemoryStore::new()))
    } else {
        let base = std::env::var_os("EDGEFLOW_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("edgeflow-state"));
        Ok(std::sync::Arc::new(FsStore::new(base.join(name))?))
    }
}

/// In-memory store for tests and local single-process execution.
#[derive(Default)]
pub struct InMemoryStore {
    states: Mutex<HashMap<(CheckpointId, String), StateSnapshot>>,
    checkpoints: Mutex<Vec<CheckpointId>>,
    clean_calls: Mutex<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed checkpoint ids, in completion order.
    pub fn saved_checkpoints(&self) -> Vec<CheckpointId> {
        self.checkpoints
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// The snapshot saved for one operator under one checkpoint, if any.
    pub fn state_for(&self, checkpoint_id: CheckpointId, op_id: &str) -> Option<StateSnapshot> {
        self.states
            .lock()
            .ok()?
            .get(&(checkpoint_id, op_id.to_string()))
            .cloned()
    }

    /// How many times `clean()` has been called.
    pub fn clean_count(&self) -> usize {
        self.clean_calls.lock().map(|g| *g).unwrap_or(0)
    }
}

impl Store for InMemoryStore {
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        snapshot: &StateSnapshot,
    ) -> Result<()> {
        self.states
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .insert((checkpoint_id, op_id.to_string()), snapshot.clone());
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        self.checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?
            .push(checkpoint_id);
        Ok(())
    }

    fn clean(&self) -> Result<()> {
        let retained: Vec<CheckpointId> = {
            let guard = self
                .checkpoints
                .lock()
                .map_err(|_| anyhow!("checkpoint store lock poisoned"))?;
            guard
                .iter()
                .rev()
                .take(RETAINED_CHECKPOINTS)
                .copied()
                .collect()
        };
        self.states
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .retain(|(id, _), _| retained.contains(id));
        *self
            .clean_calls
            .lock()
            .map_err(|_| anyhow!("clean counter lock poisoned"))? += 1;
        Ok(())
    }
}

/// Filesystem store: one `chk-<id>` directory per checkpoint, one
/// bincode-serialized snapshot file per operator.
pub struct FsStore {
    base_path: PathBuf,
}

impl FsStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "failed to create checkpoint storage directory {}",
                base_path.display()
            )
        })?;
        Ok(Self { base_path })
    }

    fn checkpoint_dir(&self, checkpoint_id: CheckpointId) -> PathBuf {
        self.base_path.join(format!("chk-{checkpoint_id}"))
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)
            .with_context(|| format!("read_dir failed for {}", self.base_path.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_part) = name.strip_prefix("chk-") {
                if let Ok(id) = id_part.parse::<CheckpointId>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

impl Store for FsStore {
    fn save_state(
        &self,
        checkpoint_id: CheckpointId,
        op_id: &str,
        snapshot: &StateSnapshot,
    ) -> Result<()> {
        let dir = self.checkpoint_dir(checkpoint_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        let bytes = bincode::serialize(snapshot).context("serialize state snapshot failed")?;
        fs::write(dir.join(format!("{op_id}.state")), bytes)
            .context("write state snapshot failed")
    }

    fn save_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let dir = self.checkpoint_dir(checkpoint_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        let bytes = bincode::serialize(&checkpoint_id).context("serialize checkpoint id failed")?;
        fs::write(dir.join("checkpoint.bin"), bytes).context("write checkpoint marker failed")
    }

    fn clean(&self) -> Result<()> {
        let ids = self.list_checkpoints()?;
        if ids.len() <= RETAINED_CHECKPOINTS {
            return Ok(());
        }
        let purge_count = ids.len() - RETAINED_CHECKPOINTS;
        for checkpoint_id in ids.into_iter().take(purge_count) {
            let dir = self.checkpoint_dir(checkpoint_id);
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to remove {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("edgeflow-{prefix}-{}-{nanos}", std::process::id()))
    }

    fn snapshot_with(key: &str) -> StateSnapshot {
        let mut s = StateSnapshot::new();
        s.insert(key.to_string(), vec![1, 2, 3]);
        s
    }

    #[test]
    fn test_in_memory_store_roundtrip() {
        let store = InMemoryStore::new();
        store.save_state(7, "op1", &snapshot_with("k")).unwrap();
        store.save_checkpoint(7).unwrap();

        assert_eq!(store.saved_checkpoints(), vec![7]);
        assert!(store.state_for(7, "op1").unwrap().contains_key("k"));
        assert!(store.state_for(7, "op2").is_none());
    }

    #[test]
    fn test_in_memory_store_clean_retains_latest() {
        let store = InMemoryStore::new();
        for id in 1..=5 {
            store.save_state(id, "op1", &snapshot_with("k")).unwrap();
            store.save_checkpoint(id).unwrap();
        }
        store.clean().unwrap();

        assert!(store.state_for(1, "op1").is_none());
        assert!(store.state_for(2, "op1").is_none());
        assert!(store.state_for(3, "op1").is_some());
        assert!(store.state_for(5, "op1").is_some());
        assert_eq!(store.clean_count(), 1);
    }

    #[test]
    fn test_fs_store_roundtrip_and_clean() {
        let path = unique_temp_dir("fs-store");
        let store = FsStore::new(&path).unwrap();

        for id in 1..=5 {
            store.save_state(id, "op1", &snapshot_with("k")).unwrap();
            store.save_checkpoint(id).unwrap();
        }
        assert_eq!(store.list_checkpoints().unwrap(), vec![1, 2, 3, 4, 5]);

        store.clean().unwrap();
        assert_eq!(store.list_checkpoints().unwrap(), vec![3, 4, 5]);

        fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn test_create_store_by_qos() {
        let store = create_store("rule-mem", Qos::AtMostOnce).unwrap();
        store.save_checkpoint(1).unwrap();
    }
}
