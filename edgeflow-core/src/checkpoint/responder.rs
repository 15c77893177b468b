//! Checkpoint-facing adapters around pipeline tasks.
//!
//! The coordinator never talks to pipeline nodes directly; it triggers
//! checkpoints through [`Responder`]s. [`ResponderExecutor`] turns one
//! trigger into the full task-local protocol step: broadcast the barrier
//! downstream, stage a synchronous snapshot, persist it asynchronously,
//! and report the outcome on the signal channel.

use crate::checkpoint::TaskRole;
use crate::context::CheckpointUnsupported;
use crate::types::{Barrier, CheckpointId, Signal, StreamData, StreamElement};
use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use std::thread;

/// The only contract the coordinator requires of a task: it can be
/// triggered and it has a name.
pub trait Responder: Send + Sync {
    fn trigger_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()>;
    fn name(&self) -> &str;
}

/// Wraps one pipeline task for checkpoint triggering.
pub struct ResponderExecutor<T: StreamData> {
    signal_tx: Sender<Signal>,
    task: TaskRole<T>,
}

impl<T: StreamData> ResponderExecutor<T> {
    pub fn new(signal_tx: Sender<Signal>, task: TaskRole<T>) -> Self {
        Self { signal_tx, task }
    }
}

impl<T: StreamData> Responder for ResponderExecutor<T> {
    fn name(&self) -> &str {
        self.task.name()
    }

    fn trigger_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let name = self.task.name().to_string();
        let ctx = self
            .task
            .stream_context()
            .ok_or_else(|| anyhow!("task {} is not opened", name))?;
        if !ctx.supports_checkpoint() {
            return Err(CheckpointUnsupported { op_id: name }.into());
        }

        // The barrier travels in-order with the records broadcast before
        // it on each output channel; everything before it belongs to this
        // checkpoint.
        self.task
            .broadcast(StreamElement::Barrier(Barrier::new(
                checkpoint_id,
                name.as_str(),
            )))?;

        // Stage the snapshot before any further record is processed, so
        // it cannot drift past the barrier's position in the stream.
        ctx.snapshot()?;

        // Persistence may touch slow storage; push it off the
        // barrier-broadcast path and report the outcome as a signal.
        let signal_tx = self.signal_tx.clone();
        thread::spawn(move || {
            let barrier = Barrier::new(checkpoint_id, name);
            let signal = match ctx.save_state(checkpoint_id) {
                Ok(()) => Signal::ack(barrier),
                Err(e) => {
                    tracing::warn!(
                        "save state of checkpoint {} for task {} failed: {}",
                        checkpoint_id,
                        barrier.op_id,
                        e
                    );
                    Signal::dec(barrier)
                }
            };
            if signal_tx.send(signal).is_err() {
                tracing::debug!("coordinator signal channel closed, dropping signal");
            }
        });
        Ok(())
    }
}
