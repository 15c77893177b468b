//! Shared source sub-topologies.
//!
//! Multiple rules consuming the same stream share one source-plus-prefix
//! chain. A [`SrcSubTopo`] is created once in the [`SubTopoPool`], opened
//! by the first rule that needs it, reference-counted per rule, and torn
//! down when the last referencing rule closes.
//!
//! For checkpointing, only the splice point matters: the sub-topology
//! contributes its source to a consuming rule's checkpoint source list,
//! while its interior operators forward barriers untouched.

use crate::checkpoint::{NonSourceTask, StreamTask};
use crate::channel::ChannelSender;
use crate::context::{CancelHandle, StreamContext};
use crate::node::{Emitter, OperatorNode, SourceNode};
use crate::store::create_store;
use crate::types::{Qos, StreamData};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

type PoolInner<T> = Mutex<HashMap<String, Arc<SrcSubTopo<T>>>>;

/// Registry of shared sub-topologies, keyed by name. The pool lock is
/// dedicated to sub-topology lifecycle and is never held while touching
/// per-rule state.
pub struct SubTopoPool<T: StreamData> {
    inner: Arc<PoolInner<T>>,
}

impl<T: StreamData> SubTopoPool<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch the sub-topology registered under `name`, building and wiring
    /// it on first use. Returns the instance and whether it already
    /// existed.
    pub fn get_or_create<F>(&self, name: &str, build: F) -> Result<(Arc<SrcSubTopo<T>>, bool)>
    where
        F: FnOnce() -> (Arc<SourceNode<T>>, Vec<Arc<OperatorNode<T>>>),
    {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("sub topo pool lock poisoned"))?;
        if let Some(existing) = guard.get(name) {
            return Ok((Arc::clone(existing), true));
        }

        let (source, ops) = build();
        // Wire the linear prefix chain: source -> ops[0] -> ops[1] -> ...
        let mut upstream: &dyn Emitter<T> = source.as_ref();
        for op in &ops {
            upstream.add_output(op.input_sender(), op.name())?;
            op.add_input_count();
            upstream = op.as_ref();
        }

        let subtopo = Arc::new(SrcSubTopo {
            name: Arc::from(name),
            source,
            ops,
            ref_count: AtomicI32::new(0),
            ref_rules: RwLock::new(HashMap::new()),
            opened: AtomicBool::new(false),
            cancel: Mutex::new(None),
            pool: Arc::downgrade(&self.inner),
        });
        guard.insert(name.to_string(), Arc::clone(&subtopo));
        Ok((subtopo, false))
    }

    pub fn get(&self, name: &str) -> Option<Arc<SrcSubTopo<T>>> {
        self.inner.lock().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: StreamData> Default for SubTopoPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference-counted, possibly multi-rule-shared prefix of the DAG.
pub struct SrcSubTopo<T: StreamData> {
    name: Arc<str>,

    // creation state
    source: Arc<SourceNode<T>>,
    /// May be empty.
    ops: Vec<Arc<OperatorNode<T>>>,

    // runtime state: ref state affects the pool, updated when a rule is
    // created or stopped; open state affects the running loop.
    ref_count: AtomicI32,
    ref_rules: RwLock<HashMap<String, Sender<anyhow::Error>>>,
    opened: AtomicBool,
    cancel: Mutex<Option<CancelHandle>>,
    pool: Weak<PoolInner<T>>,
}

impl<T: StreamData> SrcSubTopo<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_source(&self) -> Arc<SourceNode<T>> {
        Arc::clone(&self.source)
    }

    pub fn ops_count(&self) -> usize {
        self.ops.len()
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Register a rule as a consumer without starting the shared chain.
    /// Rule planning uses this to hold the sub-topology while the rest of
    /// the rule is still being assembled.
    pub fn add_ref(&self, rule_id: &str, parent_err: Sender<anyhow::Error>) -> Result<()> {
        let mut guard = self
            .ref_rules
            .write()
            .map_err(|_| anyhow!("ref rules lock poisoned"))?;
        if !guard.contains_key(rule_id) {
            guard.insert(rule_id.to_string(), parent_err);
            let refs = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(
                "sub topo {} referenced by rule {} with {} ref",
                self.name,
                rule_id,
                refs
            );
        }
        Ok(())
    }

    /// Register `ctx`'s rule as a consumer and start the shared chain if
    /// it is not running yet. Racing opens from concurrent rule planning
    /// are serialized by the atomic open flag.
    pub fn open(
        self: &Arc<Self>,
        ctx: &StreamContext,
        parent_err: Sender<anyhow::Error>,
    ) -> Result<()> {
        self.add_ref(ctx.rule_id(), parent_err)?;

        // It may have been opened before but failed; in that case the flag
        // was reset and this attempt tries again.
        if self
            .opened
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Err(e) = self.open_inner() {
                self.opened.store(false, Ordering::SeqCst);
                self.notify_error(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn open_inner(self: &Arc<Self>) -> Result<()> {
        let shared_id = format!("$$subtopo_{}", self.name);
        let (pctx, cancel) = StreamContext::with_cancel(&shared_id);
        let store = create_store(&format!("subtopo_{}", self.name), Qos::AtMostOnce)?;
        let (err_tx, err_rx) = bounded::<anyhow::Error>(8);

        for op in &self.ops {
            op.open(
                pctx.with_meta(&shared_id, op.name(), Arc::clone(&store)),
                err_tx.clone(),
            )?;
        }
        self.source.open(
            pctx.with_meta(&shared_id, self.source.name(), Arc::clone(&store)),
            err_tx.clone(),
        )?;

        *self
            .cancel
            .lock()
            .map_err(|_| anyhow!("cancel handle lock poisoned"))? = Some(cancel);

        let subtopo = Arc::clone(self);
        let done = pctx.done().clone();
        thread::spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(err_rx) -> e => match e {
                        Ok(e) => {
                            tracing::info!("sub topo {} exit for error {}", subtopo.name, e);
                            subtopo.notify_error(&e);
                            break;
                        }
                        Err(_) => break,
                    },
                    recv(done) -> _ => break,
                }
            }
            tracing::info!("sub topo {} closed", subtopo.name);
            subtopo.opened.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    fn notify_error(&self, e: &anyhow::Error) {
        if let Ok(guard) = self.ref_rules.read() {
            for (rule, tx) in guard.iter() {
                tracing::debug!("notify error {} to rule {}", e, rule);
                let _ = tx.try_send(anyhow!("{}", e));
            }
        }
    }

    /// Drop one rule's reference. The shared chain is torn down, and the
    /// pool entry removed, when the last reference goes away.
    pub fn close(&self, rule_id: &str) {
        let removed = self
            .ref_rules
            .write()
            .ok()
            .map(|mut g| g.remove(rule_id).is_some())
            .unwrap_or(false);
        if !removed {
            return;
        }
        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            if let Ok(mut guard) = self.cancel.lock() {
                if let Some(cancel) = guard.take() {
                    cancel.cancel();
                }
            }
            if let Some(pool) = self.pool.upgrade() {
                if let Ok(mut guard) = pool.lock() {
                    guard.remove(&*self.name);
                }
            }
        }
    }

    /// Splice this sub-topology into a consuming rule's checkpoint task
    /// lists. Only the source is registered; the interior operators stay
    /// out of the rule's barrier accounting and simply forward barriers.
    pub fn enable_checkpoint(&self, sources: &mut Vec<Arc<dyn StreamTask<T>>>) {
        sources.push(Arc::clone(&self.source) as Arc<dyn StreamTask<T>>);
    }
}

impl<T: StreamData> Emitter<T> for SrcSubTopo<T> {
    fn name(&self) -> &str {
        &self.name
    }

    /// Downstream rules attach to the tail of the prefix chain.
    fn add_output(&self, output: ChannelSender<T>, name: &str) -> Result<()> {
        match self.ops.last() {
            Some(op) => op.add_output(output, name),
            None => self.source.add_output(output, name),
        }
    }

    fn is_source(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[path = "tests/subtopo_tests.rs"]
mod tests;
