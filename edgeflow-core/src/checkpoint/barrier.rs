//! Barrier handling state machines for fan-in operators.
//!
//! Selected by QoS at topology-build time:
//! - at-least-once -> [`BarrierTracker`]: count barriers per checkpoint,
//!   never block data
//! - exactly-once -> [`BarrierAligner`]: block each input channel once its
//!   barrier arrives, buffering its records until every channel has
//!   presented the barrier (a consistent cut)
//! - at-most-once -> no handler; barriers are not produced at all
//!
//! Handlers run inside the owning node's input loop: `process` either
//! consumes an item (barriers, buffered records) or hands it back for
//! normal processing.

use crate::channel::{ChannelItem, ChannelSender};
use crate::checkpoint::responder::Responder;
use crate::types::{Barrier, CheckpointId, Signal, StreamData, StreamElement};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

/// The closed set of barrier handling strategies.
pub enum BarrierHandler<T: StreamData> {
    Tracker(BarrierTracker),
    Aligner(BarrierAligner<T>),
}

impl<T: StreamData> BarrierHandler<T> {
    /// Non-blocking counting handler (at-least-once).
    pub fn tracker(responder: Arc<dyn Responder>, input_count: usize) -> Self {
        Self::Tracker(BarrierTracker::new(responder, input_count))
    }

    /// Blocking alignment handler (exactly-once). `signal_tx` is used to
    /// cancel a checkpoint whose alignment gets preempted.
    pub fn aligner(
        responder: Arc<dyn Responder>,
        input_count: usize,
        signal_tx: crossbeam_channel::Sender<Signal>,
    ) -> Self {
        Self::Aligner(BarrierAligner::new(responder, input_count, signal_tx))
    }

    /// Run one item through the handler. Returns `None` when the item was
    /// consumed (a barrier, or a record buffered during alignment), or the
    /// item itself when the caller should process it normally.
    pub fn process(&mut self, item: ChannelItem<T>) -> Option<ChannelItem<T>> {
        match self {
            Self::Tracker(t) => t.process(item),
            Self::Aligner(a) => a.process(item),
        }
    }

    /// Install the sender that buffered items are replayed into after an
    /// alignment completes. No-op for the tracker.
    pub fn set_output(&mut self, output: ChannelSender<T>) {
        match self {
            Self::Tracker(_) => {}
            Self::Aligner(a) => a.set_output(output),
        }
    }
}

/// Non-blocking barrier counting for at-least-once delivery.
///
/// Data records are never intercepted, so duplicate delivery is possible
/// after a restart but throughput is unaffected.
pub struct BarrierTracker {
    responder: Arc<dyn Responder>,
    input_count: usize,
    pending_checkpoints: HashMap<CheckpointId, usize>,
}

impl BarrierTracker {
    pub fn new(responder: Arc<dyn Responder>, input_count: usize) -> Self {
        Self {
            responder,
            input_count,
            pending_checkpoints: HashMap::new(),
        }
    }

    pub fn process<T: StreamData>(&mut self, item: ChannelItem<T>) -> Option<ChannelItem<T>> {
        match &item.element {
            StreamElement::Barrier(b) => {
                let barrier = b.clone();
                self.process_barrier(&barrier);
                None
            }
            _ => Some(item),
        }
    }

    fn process_barrier(&mut self, b: &Barrier) {
        if self.input_count == 1 {
            if let Err(e) = self.responder.trigger_checkpoint(b.checkpoint_id) {
                tracing::error!(
                    "trigger checkpoint for {} err: {}",
                    self.responder.name(),
                    e
                );
            }
            return;
        }
        let count = self
            .pending_checkpoints
            .entry(b.checkpoint_id)
            .or_insert(0);
        *count += 1;
        if *count == self.input_count {
            if let Err(e) = self.responder.trigger_checkpoint(b.checkpoint_id) {
                tracing::error!(
                    "trigger checkpoint for {} err: {}",
                    self.responder.name(),
                    e
                );
                return;
            }
            let completed = b.checkpoint_id;
            // Older in-flight counts can never complete once a newer
            // checkpoint has; drop them along with the finished one.
            self.pending_checkpoints.retain(|cid, _| *cid > completed);
        }
    }
}

/// Blocking barrier alignment for exactly-once delivery.
///
/// States: idle (no checkpoint in progress) -> aligning (at least one
/// blocked channel) -> idle. Records arriving on a blocked channel are
/// buffered and replayed, in receipt order, once the alignment completes.
pub struct BarrierAligner<T: StreamData> {
    responder: Arc<dyn Responder>,
    signal_tx: crossbeam_channel::Sender<Signal>,
    input_count: usize,
    current_checkpoint_id: CheckpointId,
    output: Option<ChannelSender<T>>,
    blocked_channels: HashSet<String>,
    buffer: Vec<ChannelItem<T>>,
}

impl<T: StreamData> BarrierAligner<T> {
    pub fn new(
        responder: Arc<dyn Responder>,
        input_count: usize,
        signal_tx: crossbeam_channel::Sender<Signal>,
    ) -> Self {
        Self {
            responder,
            signal_tx,
            input_count,
            current_checkpoint_id: 0,
            output: None,
            blocked_channels: HashSet::new(),
            buffer: Vec::new(),
        }
    }

    pub fn set_output(&mut self, output: ChannelSender<T>) {
        self.output = Some(output);
    }

    pub fn process(&mut self, item: ChannelItem<T>) -> Option<ChannelItem<T>> {
        match &item.element {
            StreamElement::Barrier(b) => {
                let barrier = b.clone();
                self.process_barrier(&barrier);
                None
            }
            _ => {
                if self.input_count > 1
                    && !self.blocked_channels.is_empty()
                    && self.blocked_channels.contains(&*item.channel)
                {
                    self.buffer.push(item);
                    return None;
                }
                Some(item)
            }
        }
    }

    fn process_barrier(&mut self, b: &Barrier) {
        tracing::debug!("aligner for {} process barrier {:?}", self.responder.name(), b);
        if self.input_count == 1 {
            if b.checkpoint_id > self.current_checkpoint_id {
                self.current_checkpoint_id = b.checkpoint_id;
                if let Err(e) = self.responder.trigger_checkpoint(b.checkpoint_id) {
                    tracing::error!(
                        "trigger checkpoint for {} err: {}",
                        self.responder.name(),
                        e
                    );
                }
            }
            return;
        }

        if !self.blocked_channels.is_empty() {
            if b.checkpoint_id == self.current_checkpoint_id {
                self.on_barrier(&b.op_id);
            } else if b.checkpoint_id > self.current_checkpoint_id {
                tracing::info!(
                    "received barrier for checkpoint {} before completing checkpoint {}, skipping the current one",
                    b.checkpoint_id,
                    self.current_checkpoint_id
                );
                // The abandoned checkpoint can never complete here; tell
                // the coordinator instead of letting it dangle. Buffered
                // records are kept and replay with the next alignment.
                let abandoned =
                    Barrier::new(self.current_checkpoint_id, self.responder.name());
                if self.signal_tx.send(Signal::dec(abandoned)).is_err() {
                    tracing::debug!("coordinator signal channel closed, dropping dec");
                }
                self.blocked_channels.clear();
                self.begin_new_alignment(b);
            } else {
                // Stale barrier from an already handled checkpoint.
                return;
            }
        } else if b.checkpoint_id > self.current_checkpoint_id {
            self.begin_new_alignment(b);
        } else {
            return;
        }

        if self.blocked_channels.len() == self.input_count {
            tracing::debug!(
                "received all barriers, triggering checkpoint {}",
                b.checkpoint_id
            );
            if let Err(e) = self.responder.trigger_checkpoint(b.checkpoint_id) {
                tracing::error!(
                    "trigger checkpoint for {} err: {}",
                    self.responder.name(),
                    e
                );
                return;
            }
            self.blocked_channels.clear();
            if !self.buffer.is_empty() {
                let items = std::mem::take(&mut self.buffer);
                match &self.output {
                    Some(output) => {
                        // Replay on a dedicated thread so a large buffer
                        // flush cannot stall barrier handling.
                        let output = output.clone();
                        thread::spawn(move || {
                            for item in items {
                                if output.send(item).is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    None => tracing::error!(
                        "aligner for {} has no output channel, dropping {} buffered items",
                        self.responder.name(),
                        items.len()
                    ),
                }
            }
        }
    }

    fn on_barrier(&mut self, channel: &str) {
        if !self.blocked_channels.contains(channel) {
            self.blocked_channels.insert(channel.to_string());
            tracing::debug!("received barrier from channel {}", channel);
        }
    }

    fn begin_new_alignment(&mut self, barrier: &Barrier) {
        self.current_checkpoint_id = barrier.checkpoint_id;
        self.on_barrier(&barrier.op_id);
        tracing::debug!(
            "starting stream alignment for checkpoint {}",
            barrier.checkpoint_id
        );
    }
}

#[cfg(test)]
#[path = "tests/barrier_tests.rs"]
mod tests;
