//! Pipeline nodes.
//!
//! Minimal source/operator/sink node implementations that the topology
//! wires together and the checkpoint subsystem drives through the task
//! capability traits. Real connectors live outside this crate; these nodes
//! carry the lifecycle and barrier plumbing they all share.
//!
//! Every node runs one worker thread looping on its single input channel
//! (sources loop on their generator instead). Fan-in is modeled by all
//! upstreams sending into the same channel, with each item tagged by the
//! emitting task's name.

pub mod operator;
pub mod sink;
pub mod source;

pub use operator::{fn_operator, FnOperator, Operator, OperatorNode};
pub use sink::{CollectSink, Sink, SinkNode};
pub use source::{ChannelSource, Source, SourceCollector, SourceNode};

use crate::channel::{item_channel, ChannelItem, ChannelReceiver, ChannelSender, DEFAULT_CHANNEL_CAPACITY};
use crate::checkpoint::BarrierHandler;
use crate::context::StreamContext;
use crate::types::{Qos, StreamData, StreamElement};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Anything that can feed a downstream node: sources, operators, and
/// shared sub-topologies. Used only while wiring a topology.
pub trait Emitter<T: StreamData>: Send + Sync {
    fn name(&self) -> &str;

    /// Register a downstream input channel under the receiver's name.
    fn add_output(&self, output: ChannelSender<T>, name: &str) -> Result<()>;

    fn is_source(&self) -> bool {
        false
    }
}

/// State shared by every node kind: identity, downstream outputs, the
/// execution context installed at open time, and the rule QoS.
pub(crate) struct NodeState<T: StreamData> {
    name: Arc<str>,
    outputs: Mutex<HashMap<String, ChannelSender<T>>>,
    ctx: Mutex<Option<StreamContext>>,
    qos: Mutex<Qos>,
}

impl<T: StreamData> NodeState<T> {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            outputs: Mutex::new(HashMap::new()),
            ctx: Mutex::new(None),
            qos: Mutex::new(Qos::AtMostOnce),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_ctx(&self, ctx: StreamContext) {
        if let Ok(mut guard) = self.ctx.lock() {
            *guard = Some(ctx);
        }
    }

    pub(crate) fn context(&self) -> Option<StreamContext> {
        self.ctx.lock().ok().and_then(|g| g.clone())
    }

    pub(crate) fn set_qos(&self, qos: Qos) {
        if let Ok(mut guard) = self.qos.lock() {
            *guard = qos;
        }
    }

    pub(crate) fn qos(&self) -> Qos {
        self.qos.lock().map(|g| *g).unwrap_or(Qos::AtMostOnce)
    }

    pub(crate) fn add_output(&self, output: ChannelSender<T>, name: &str) -> Result<()> {
        let mut guard = self
            .outputs
            .lock()
            .map_err(|_| anyhow!("outputs lock poisoned"))?;
        if guard.contains_key(name) {
            return Err(anyhow!(
                "node {} already has an output named {}",
                self.name,
                name
            ));
        }
        guard.insert(name.to_string(), output);
        Ok(())
    }

    /// Send an element to every downstream channel, tagged with this
    /// node's name. In-channel ordering relative to earlier broadcasts is
    /// what the snapshot protocol relies on.
    pub(crate) fn broadcast(&self, element: StreamElement<T>) -> Result<()> {
        let guard = self
            .outputs
            .lock()
            .map_err(|_| anyhow!("outputs lock poisoned"))?;
        for output in guard.values() {
            output.send(ChannelItem::new(Arc::clone(&self.name), element.clone()))?;
        }
        Ok(())
    }
}

/// Extra state for nodes with an input side: the single physical input
/// channel, upstream count, and the barrier handler installed by the
/// coordinator.
pub(crate) struct InputState<T: StreamData> {
    input_tx: ChannelSender<T>,
    input_rx: Mutex<Option<ChannelReceiver<T>>>,
    input_count: AtomicUsize,
    barrier_handler: Mutex<Option<BarrierHandler<T>>>,
}

impl<T: StreamData> InputState<T> {
    pub(crate) fn new() -> Self {
        let (input_tx, input_rx) = item_channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            input_count: AtomicUsize::new(0),
            barrier_handler: Mutex::new(None),
        }
    }

    pub(crate) fn input_sender(&self) -> ChannelSender<T> {
        self.input_tx.clone()
    }

    pub(crate) fn take_receiver(&self) -> Result<ChannelReceiver<T>> {
        self.input_rx
            .lock()
            .map_err(|_| anyhow!("input receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("node input already taken, node opened twice?"))
    }

    pub(crate) fn input_count(&self) -> usize {
        self.input_count.load(Ordering::SeqCst)
    }

    pub(crate) fn add_input_count(&self) {
        self.input_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_handler(&self, handler: BarrierHandler<T>) {
        if let Ok(mut guard) = self.barrier_handler.lock() {
            *guard = Some(handler);
        }
    }

    pub(crate) fn take_handler(&self) -> Option<BarrierHandler<T>> {
        self.barrier_handler.lock().ok().and_then(|mut g| g.take())
    }
}
