//! Per-rule topology lifecycle.
//!
//! A [`Topology`] owns the operator DAG of one rule: it wires sources,
//! operators, and sinks, opens them in reverse order (sinks first, so
//! downstream capacity exists before upstream starts producing), builds
//! and activates a checkpoint [`Coordinator`] when the rule's QoS requires
//! one, and exposes idempotent cancel / wait-for-drain semantics.

use crate::checkpoint::{Coordinator, NonSourceTask, SinkTask, StreamTask};
use crate::context::{CancelHandle, StreamContext};
use crate::node::{Emitter, OperatorNode, SinkNode, SourceNode};
use crate::store::{create_store, Store};
use crate::subtopo::SrcSubTopo;
use crate::types::{Qos, StreamData};
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on waiting for the final forced checkpoint during rule
/// shutdown. Bounded by a timeout rather than the context, because the
/// rule is exiting and must not be delayed indefinitely.
pub const FORCE_EXIT_TIMEOUT: Duration = Duration::from_secs(3);

/// JSON-friendly description of the wired DAG.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrintableTopo {
    pub sources: Vec<String>,
    pub edges: HashMap<String, Vec<String>>,
}

/// A rule's data entry point: either its own source node or a shared
/// sub-topology spliced in from the pool.
pub enum DataSource<T: StreamData> {
    Node(Arc<SourceNode<T>>),
    SubTopo(Arc<SrcSubTopo<T>>),
}

impl<T: StreamData> DataSource<T> {
    pub fn name(&self) -> &str {
        match self {
            DataSource::Node(n) => n.name(),
            DataSource::SubTopo(s) => s.name(),
        }
    }

    /// The wiring surface downstream nodes attach to.
    pub fn emitter(&self) -> &dyn Emitter<T> {
        match self {
            DataSource::Node(n) => n.as_ref(),
            DataSource::SubTopo(s) => s.as_ref(),
        }
    }
}

/// The operator DAG of one rule.
pub struct Topology<T: StreamData> {
    name: String,
    qos: Qos,
    checkpoint_interval: Duration,
    sources: Vec<DataSource<T>>,
    ops: Vec<Arc<OperatorNode<T>>>,
    sinks: Vec<Arc<SinkNode<T>>>,
    ctx: Option<StreamContext>,
    cancel: Option<CancelHandle>,
    drain_rx: Option<Receiver<anyhow::Error>>,
    store_override: Option<Arc<dyn Store>>,
    coordinator: Option<Arc<Coordinator<T>>>,
    threads: Vec<JoinHandle<()>>,
    save_state_before_stop: bool,
    cancelled: bool,
    topo: PrintableTopo,
}

impl<T: StreamData> Topology<T> {
    pub fn new(name: &str, qos: Qos, checkpoint_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            qos,
            checkpoint_interval,
            sources: Vec::new(),
            ops: Vec::new(),
            sinks: Vec::new(),
            ctx: None,
            cancel: None,
            drain_rx: None,
            store_override: None,
            coordinator: None,
            threads: Vec::new(),
            save_state_before_stop: false,
            cancelled: false,
            topo: PrintableTopo::default(),
        }
    }

    /// Use this store instead of creating one per rule. Mostly for tests.
    pub fn with_store(&mut self, store: Arc<dyn Store>) {
        self.store_override = Some(store);
    }

    /// Take one final checkpoint (bounded by [`FORCE_EXIT_TIMEOUT`])
    /// before tearing the rule down.
    pub fn set_save_state_before_stop(&mut self, on: bool) {
        self.save_state_before_stop = on;
    }

    pub fn add_src(&mut self, src: DataSource<T>) {
        self.topo.sources.push(format!("source_{}", src.name()));
        self.sources.push(src);
    }

    pub fn add_operator(
        &mut self,
        inputs: &[&dyn Emitter<T>],
        op: Arc<OperatorNode<T>>,
    ) -> Result<()> {
        for input in inputs {
            input.add_output(op.input_sender(), op.name())?;
            op.add_input_count();
            self.add_edge(input.is_source(), input.name(), "op", op.name());
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn add_sink(&mut self, inputs: &[&dyn Emitter<T>], sink: Arc<SinkNode<T>>) -> Result<()> {
        for input in inputs {
            input.add_output(sink.input_sender(), sink.name())?;
            sink.add_input_count();
            self.add_edge(input.is_source(), input.name(), "sink", sink.name());
        }
        self.sinks.push(sink);
        Ok(())
    }

    fn add_edge(&mut self, from_source: bool, from: &str, to_type: &str, to: &str) {
        let from_label = if from_source {
            format!("source_{from}")
        } else {
            format!("op_{from}")
        };
        self.topo
            .edges
            .entry(from_label)
            .or_default()
            .push(format!("{to_type}_{to}"));
    }

    /// Open the rule pipeline. Returns the drain channel that node worker
    /// threads report fatal errors on.
    pub fn open(&mut self) -> Result<Receiver<anyhow::Error>> {
        if let (Some(ctx), Some(drain)) = (&self.ctx, &self.drain_rx) {
            if !ctx.is_cancelled() {
                tracing::info!("rule {} is already running, do nothing", self.name);
                return Ok(drain.clone());
            }
        }

        let (root, cancel) = StreamContext::with_cancel(&self.name);
        let (drain_tx, drain_rx) = bounded::<anyhow::Error>(16);
        let store = match &self.store_override {
            Some(store) => Arc::clone(store),
            None => create_store(&self.name, self.qos)?,
        };
        tracing::info!("opening rule {}", self.name);

        self.enable_checkpoint(&store, &root);

        // Open stream sinks first, then operators, then sources, so that
        // every downstream input exists before upstream starts producing.
        for sink in &self.sinks {
            let handle = sink.open(
                root.with_meta(&self.name, sink.name(), Arc::clone(&store)),
                drain_tx.clone(),
            )?;
            self.threads.push(handle);
        }
        for op in &self.ops {
            let handle = op.open(
                root.with_meta(&self.name, op.name(), Arc::clone(&store)),
                drain_tx.clone(),
            )?;
            self.threads.push(handle);
        }
        for src in &self.sources {
            match src {
                DataSource::Node(node) => {
                    let handle = node.open(
                        root.with_meta(&self.name, node.name(), Arc::clone(&store)),
                        drain_tx.clone(),
                    )?;
                    self.threads.push(handle);
                }
                DataSource::SubTopo(subtopo) => {
                    subtopo.open(&root, drain_tx.clone())?;
                }
            }
        }

        if let Some(coordinator) = &self.coordinator {
            coordinator.activate()?;
        }

        self.ctx = Some(root);
        self.cancel = Some(cancel);
        self.cancelled = false;
        self.drain_rx = Some(drain_rx.clone());
        Ok(drain_rx)
    }

    fn enable_checkpoint(&mut self, store: &Arc<dyn Store>, root: &StreamContext) {
        if self.qos < Qos::AtLeastOnce {
            return;
        }
        let mut sources: Vec<Arc<dyn StreamTask<T>>> = Vec::new();
        for src in &self.sources {
            match src {
                DataSource::Node(node) => {
                    sources.push(Arc::clone(node) as Arc<dyn StreamTask<T>>);
                }
                DataSource::SubTopo(subtopo) => subtopo.enable_checkpoint(&mut sources),
            }
        }
        let operators: Vec<Arc<dyn NonSourceTask<T>>> = self
            .ops
            .iter()
            .map(|op| Arc::clone(op) as Arc<dyn NonSourceTask<T>>)
            .collect();
        let sinks: Vec<Arc<dyn SinkTask<T>>> = self
            .sinks
            .iter()
            .map(|sink| Arc::clone(sink) as Arc<dyn SinkTask<T>>)
            .collect();
        self.coordinator = Some(Arc::new(Coordinator::new(
            &self.name,
            &sources,
            &operators,
            &sinks,
            self.qos,
            Arc::clone(store),
            self.checkpoint_interval,
            root.clone(),
        )));
    }

    /// Tear the rule down. Idempotent: repeated calls are no-ops. When
    /// checkpointing is active and save-state-before-stop is set, one
    /// final checkpoint is taken first, bounded by [`FORCE_EXIT_TIMEOUT`].
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        if let Some(coordinator) = &self.coordinator {
            if coordinator.is_activated() && self.save_state_before_stop {
                match coordinator.force_save_state() {
                    Ok(notify) => match notify.recv_timeout(FORCE_EXIT_TIMEOUT) {
                        Ok(saved) => tracing::info!(
                            "force save state for rule {} finished, saved: {}",
                            self.name,
                            saved
                        ),
                        Err(_) => tracing::warn!(
                            "force save state for rule {} did not finish in time",
                            self.name
                        ),
                    },
                    Err(e) => {
                        tracing::warn!("force save state for rule {} failed: {}", self.name, e)
                    }
                }
            }
        }
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for src in &self.sources {
            if let DataSource::SubTopo(subtopo) = src {
                subtopo.close(&self.name);
            }
        }
        self.coordinator = None;
        self.cancelled = true;
    }

    /// Block until every node worker thread of this rule has exited.
    pub fn wait_close(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn get_coordinator(&self) -> Option<Arc<Coordinator<T>>> {
        self.coordinator.as_ref().map(Arc::clone)
    }

    pub fn get_context(&self) -> Option<StreamContext> {
        self.ctx.clone()
    }

    pub fn get_topo(&self) -> &PrintableTopo {
        &self.topo
    }
}

impl<T: StreamData> Drop for Topology<T> {
    fn drop(&mut self) {
        if !self.cancelled {
            if let Some(cancel) = self.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/topo_tests.rs"]
mod tests;
