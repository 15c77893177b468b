//! Per-operator execution context.
//!
//! Every pipeline node runs with a [`StreamContext`] carrying its rule and
//! operator identity, a cancellation token derived from the rule's root
//! context, a per-operator key/value state map, and an optional handle to
//! the rule's durable [`Store`]. Contexts with a store are
//! checkpoint-capable: `snapshot()` stages the state map in memory and
//! `save_state()` persists the staged copy.

use crate::store::{StateSnapshot, Store};
use crate::types::CheckpointId;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Error returned when a checkpoint is triggered on a task whose context
/// has no durable store attached.
#[derive(Debug)]
pub struct CheckpointUnsupported {
    pub op_id: String,
}

impl fmt::Display for CheckpointUnsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "context of operator {} does not support checkpoint",
            self.op_id
        )
    }
}

impl std::error::Error for CheckpointUnsupported {}

/// Handle used to cancel a rule's root context. Idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelHandle {
    /// Cancel the context tree. Safe to call more than once.
    pub fn cancel(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// Execution context shared by all nodes of one rule.
///
/// Cloning is cheap; clones derived via [`with_meta`](Self::with_meta)
/// share the cancellation token but own a fresh state map.
#[derive(Clone)]
pub struct StreamContext {
    rule_id: Arc<str>,
    op_id: Arc<str>,
    store: Option<Arc<dyn Store>>,
    state: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    staged: Arc<Mutex<Option<StateSnapshot>>>,
    done: Receiver<()>,
}

impl StreamContext {
    /// Create a root context for a rule together with its cancel handle.
    pub fn with_cancel(rule_id: &str) -> (Self, CancelHandle) {
        let (tx, rx) = bounded::<()>(1);
        let ctx = Self {
            rule_id: Arc::from(rule_id),
            op_id: Arc::from(""),
            store: None,
            state: Arc::new(Mutex::new(HashMap::new())),
            staged: Arc::new(Mutex::new(None)),
            done: rx,
        };
        let handle = CancelHandle {
            tx: Arc::new(Mutex::new(Some(tx))),
        };
        (ctx, handle)
    }

    /// Derive a context for one operator: same cancellation token, fresh
    /// state map, the given rule/op identity and store.
    pub fn with_meta(&self, rule_id: &str, op_id: &str, store: Arc<dyn Store>) -> Self {
        Self {
            rule_id: Arc::from(rule_id),
            op_id: Arc::from(op_id),
            store: Some(store),
            state: Arc::new(Mutex::new(HashMap::new())),
            staged: Arc::new(Mutex::new(None)),
            done: self.done.clone(),
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn op_id(&self) -> &str {
        &self.op_id
    }

    /// Channel that becomes disconnected when the rule is cancelled.
    /// Use in `select!` loops to observe cancellation.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.done.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }

    /// Whether this context can take part in checkpointing.
    pub fn supports_checkpoint(&self) -> bool {
        self.store.is_some()
    }

    /// Store a serializable value under `key` in the operator state map.
    pub fn put_state<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = bincode::serialize(value)
            .map_err(|e| anyhow!("failed to serialize state {}: {}", key, e))?;
        self.state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned"))?
            .insert(key.to_string(), bytes);
        Ok(())
    }

    /// Read a value from the operator state map. Returns `None` when absent.
    pub fn get_state<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned"))?;
        match guard.get(key) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes).map_err(|e| {
                anyhow!("failed to deserialize state {}: {}", key, e)
            })?)),
            None => Ok(None),
        }
    }

    /// Remove a value from the operator state map.
    pub fn delete_state(&self, key: &str) -> Result<()> {
        self.state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned"))?
            .remove(key);
        Ok(())
    }

    /// Add `amount` to the counter stored under `key`, creating it at zero
    /// when absent. Returns the new value.
    pub fn incr_counter(&self, key: &str, amount: i64) -> Result<i64> {
        let current: i64 = self.get_state(key)?.unwrap_or(0);
        let next = current + amount;
        self.put_state(key, &next)?;
        Ok(next)
    }

    /// Stage an in-memory copy of the state map for the checkpoint in
    /// progress. Synchronous and allocation-only; never blocks on I/O.
    pub fn snapshot(&self) -> Result<()> {
        let copy = self
            .state
            .lock()
            .map_err(|_| anyhow!("state lock poisoned"))?
            .clone();
        *self
            .staged
            .lock()
            .map_err(|_| anyhow!("staged snapshot lock poisoned"))? = Some(copy);
        Ok(())
    }

    /// Durably persist the staged snapshot under `checkpoint_id` and clear
    /// the staging area.
    pub fn save_state(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let store = self.store.as_ref().ok_or_else(|| {
            anyhow!(CheckpointUnsupported {
                op_id: self.op_id.to_string(),
            })
        })?;
        let staged = self
            .staged
            .lock()
            .map_err(|_| anyhow!("staged snapshot lock poisoned"))?
            .take()
            .unwrap_or_default();
        store.save_state(checkpoint_id, &self.op_id, &staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_state_roundtrip() {
        let (root, _cancel) = StreamContext::with_cancel("rule1");
        let store = Arc::new(InMemoryStore::new());
        let ctx = root.with_meta("rule1", "op1", store);

        ctx.put_state("count", &3i64).unwrap();
        assert_eq!(ctx.get_state::<i64>("count").unwrap(), Some(3));

        ctx.delete_state("count").unwrap();
        assert_eq!(ctx.get_state::<i64>("count").unwrap(), None);
    }

    #[test]
    fn test_incr_counter() {
        let (root, _cancel) = StreamContext::with_cancel("rule1");
        let store = Arc::new(InMemoryStore::new());
        let ctx = root.with_meta("rule1", "op1", store);

        assert_eq!(ctx.incr_counter("hits", 1).unwrap(), 1);
        assert_eq!(ctx.incr_counter("hits", 2).unwrap(), 3);
    }

    #[test]
    fn test_snapshot_and_save_state() {
        let (root, _cancel) = StreamContext::with_cancel("rule1");
        let store = Arc::new(InMemoryStore::new());
        let ctx = root.with_meta("rule1", "op1", store.clone());

        ctx.put_state("k", &"v".to_string()).unwrap();
        ctx.snapshot().unwrap();
        // Mutations after the snapshot do not leak into the staged copy.
        ctx.put_state("k2", &1i64).unwrap();
        ctx.save_state(100).unwrap();

        let saved = store.state_for(100, "op1").unwrap();
        assert!(saved.contains_key("k"));
        assert!(!saved.contains_key("k2"));
    }

    #[test]
    fn test_save_state_without_store_is_typed_error() {
        let (root, _cancel) = StreamContext::with_cancel("rule1");
        assert!(!root.supports_checkpoint());
        let err = root.save_state(1).unwrap_err();
        assert!(err.downcast_ref::<CheckpointUnsupported>().is_some());
    }

    #[test]
    fn test_cancellation() {
        let (ctx, cancel) = StreamContext::with_cancel("rule1");
        assert!(!ctx.is_cancelled());
        cancel.cancel();
        assert!(ctx.is_cancelled());
        // Idempotent.
        cancel.cancel();
        assert!(ctx.is_cancelled());
    }
}
