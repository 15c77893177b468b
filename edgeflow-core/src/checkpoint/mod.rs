//! Checkpoint coordination following Chandy-Lamport distributed snapshots.
//!
//! A rule's pipeline gains at-least-once or exactly-once delivery through:
//! - Periodic checkpoint triggering by a per-rule [`Coordinator`]
//! - [`Barrier`](crate::types::Barrier) propagation through the DAG,
//!   in-band with ordinary records
//! - Barrier counting ([`BarrierTracker`]) or blocking alignment
//!   ([`BarrierAligner`]) on fan-in operators, selected by QoS
//! - Synchronous state snapshots with asynchronous persistence, reported
//!   back as ACK/DEC signals
//!
//! The coordinator only ever talks to tasks through the [`Responder`]
//! contract; pipeline nodes expose the capability traits below.

pub mod barrier;
pub mod coordinator;
pub mod responder;

pub use barrier::{BarrierAligner, BarrierHandler, BarrierTracker};
pub use coordinator::{Coordinator, PendingCheckpoint};
pub use responder::{Responder, ResponderExecutor};

use crate::channel::ChannelSender;
use crate::context::StreamContext;
use crate::types::{Qos, StreamData, StreamElement};
use anyhow::Result;
use std::sync::Arc;

/// Capability every pipeline node exposes to the checkpoint subsystem.
pub trait StreamTask<T: StreamData>: Send + Sync {
    fn name(&self) -> &str;

    /// The node's execution context. `None` until the node is opened.
    fn stream_context(&self) -> Option<StreamContext>;

    /// Inject an element into every downstream output channel, ordered
    /// with the records broadcast before and after it.
    fn broadcast(&self, element: StreamElement<T>) -> Result<()>;

    fn set_qos(&self, qos: Qos);
}

/// Additional capability of non-source nodes: input bookkeeping and
/// barrier handling.
pub trait NonSourceTask<T: StreamData>: StreamTask<T> {
    /// Number of upstream tasks feeding this node.
    fn input_count(&self) -> usize;

    /// Register one more upstream. Called while wiring the topology.
    fn add_input_count(&self);

    /// Install the barrier handler consulted by the node's input loop.
    fn set_barrier_handler(&self, handler: BarrierHandler<T>);

    /// Sender into the node's own input channel, used to wire upstreams
    /// and to replay items buffered during alignment.
    fn input_sender(&self) -> ChannelSender<T>;
}

/// Additional capability of sink nodes.
pub trait SinkTask<T: StreamData>: NonSourceTask<T> {
    /// Ask the sink to persist its resend cache. Called when a checkpoint
    /// completes.
    fn save_cache(&self);
}

/// A pipeline node in one of the three fixed roles. The checkpoint
/// subsystem needs only this closed set, so roles are tagged variants
/// rather than open trait objects.
#[derive(Clone)]
pub enum TaskRole<T: StreamData> {
    Source(Arc<dyn StreamTask<T>>),
    Operator(Arc<dyn NonSourceTask<T>>),
    Sink(Arc<dyn SinkTask<T>>),
}

impl<T: StreamData> TaskRole<T> {
    pub fn name(&self) -> &str {
        match self {
            TaskRole::Source(t) => t.name(),
            TaskRole::Operator(t) => t.name(),
            TaskRole::Sink(t) => t.name(),
        }
    }

    pub fn stream_context(&self) -> Option<StreamContext> {
        match self {
            TaskRole::Source(t) => t.stream_context(),
            TaskRole::Operator(t) => t.stream_context(),
            TaskRole::Sink(t) => t.stream_context(),
        }
    }

    pub fn broadcast(&self, element: StreamElement<T>) -> Result<()> {
        match self {
            TaskRole::Source(t) => t.broadcast(element),
            TaskRole::Operator(t) => t.broadcast(element),
            TaskRole::Sink(t) => t.broadcast(element),
        }
    }

    pub fn set_qos(&self, qos: Qos) {
        match self {
            TaskRole::Source(t) => t.set_qos(qos),
            TaskRole::Operator(t) => t.set_qos(qos),
            TaskRole::Sink(t) => t.set_qos(qos),
        }
    }
}
