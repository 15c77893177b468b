//! Per-rule checkpoint coordinator.
//!
//! One control thread per rule owns every mutation of the pending
//! checkpoint map; everything else reaches it through the bounded signal
//! channel, the force-save channel, or the periodic ticker. Completed
//! checkpoints live in a small ring shared with the read path.

use crate::checkpoint::barrier::BarrierHandler;
use crate::checkpoint::responder::{Responder, ResponderExecutor};
use crate::checkpoint::{NonSourceTask, SinkTask, StreamTask, TaskRole};
use crate::context::StreamContext;
use crate::store::Store;
use crate::types::{current_time_millis, Barrier, CheckpointId, Qos, Signal, SignalMessage, StreamData};
use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, tick, Receiver, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Capacity of the per-rule signal channel. Generous enough that signal
/// producers never block; a lost signal would strand a pending checkpoint.
const SIGNAL_CAPACITY: usize = 1024;

/// `store.clean()` runs every this many checkpoint triggers.
const CLEAN_THRESHOLD: usize = 100;

/// Completed checkpoints retained in memory.
const MAX_COMPLETED_CHECKPOINTS: usize = 3;

/// Default trigger interval when none is configured.
const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);

/// A checkpoint that has been triggered but not yet fully acknowledged.
///
/// Mutated only by the coordinator control thread. The wait-set only ever
/// shrinks, and `is_discarded` never reverts to false.
#[derive(Debug)]
pub struct PendingCheckpoint {
    pub checkpoint_id: CheckpointId,
    is_discarded: bool,
    not_yet_ack_tasks: HashSet<String>,
}

impl PendingCheckpoint {
    fn new(checkpoint_id: CheckpointId, tasks_to_wait_for: &[Arc<dyn Responder>]) -> Self {
        Self {
            checkpoint_id,
            is_discarded: false,
            not_yet_ack_tasks: tasks_to_wait_for
                .iter()
                .map(|r| r.name().to_string())
                .collect(),
        }
    }

    fn ack(&mut self, op_id: &str) -> bool {
        if self.is_discarded {
            return false;
        }
        self.not_yet_ack_tasks.remove(op_id);
        true
    }

    fn is_fully_acked(&self) -> bool {
        self.not_yet_ack_tasks.is_empty()
    }

    fn dispose(&mut self) {
        self.is_discarded = true;
    }

    fn finalize(&self) -> CompletedCheckpoint {
        CompletedCheckpoint {
            checkpoint_id: self.checkpoint_id,
        }
    }
}

/// A successfully completed checkpoint.
#[derive(Debug, Clone)]
pub struct CompletedCheckpoint {
    pub checkpoint_id: CheckpointId,
}

/// Bounded ring of the most recently completed checkpoints.
#[derive(Debug)]
struct CheckpointStore {
    max_num: usize,
    checkpoints: VecDeque<CompletedCheckpoint>,
}

impl CheckpointStore {
    fn new(max_num: usize) -> Self {
        Self {
            max_num,
            checkpoints: VecDeque::new(),
        }
    }

    fn add(&mut self, c: CompletedCheckpoint) {
        self.checkpoints.push_back(c);
        while self.checkpoints.len() > self.max_num {
            self.checkpoints.pop_front();
        }
    }

    fn latest(&self) -> Option<CheckpointId> {
        self.checkpoints.back().map(|c| c.checkpoint_id)
    }

    fn len(&self) -> usize {
        self.checkpoints.len()
    }

    fn ids(&self) -> Vec<CheckpointId> {
        self.checkpoints.iter().map(|c| c.checkpoint_id).collect()
    }
}

fn create_barrier_handler<T: StreamData>(
    responder: Arc<dyn Responder>,
    input_count: usize,
    qos: Qos,
    signal_tx: Sender<Signal>,
) -> Option<BarrierHandler<T>> {
    match qos {
        Qos::AtLeastOnce => Some(BarrierHandler::tracker(responder, input_count)),
        Qos::ExactlyOnce => Some(BarrierHandler::aligner(responder, input_count, signal_tx)),
        Qos::AtMostOnce => None,
    }
}

/// Coordinates checkpoints across all tasks of one rule.
pub struct Coordinator<T: StreamData> {
    rule_id: String,
    tasks_to_trigger: Vec<Arc<dyn Responder>>,
    tasks_to_wait_for: Vec<Arc<dyn Responder>>,
    sink_tasks: Vec<Arc<dyn SinkTask<T>>>,
    signal_tx: Sender<Signal>,
    signal_rx: Mutex<Option<Receiver<Signal>>>,
    force_tx: Sender<Sender<bool>>,
    force_rx: Mutex<Option<Receiver<Sender<bool>>>>,
    store: Arc<dyn Store>,
    base_interval: Duration,
    ctx: StreamContext,
    activated: AtomicBool,
    in_force_save: Arc<AtomicBool>,
    completed: Arc<Mutex<CheckpointStore>>,
}

impl<T: StreamData> Coordinator<T> {
    /// Wrap every task in a responder, attach barrier handlers chosen by
    /// QoS, and size the trigger interval (5 minutes when unset).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: &str,
        sources: &[Arc<dyn StreamTask<T>>],
        operators: &[Arc<dyn NonSourceTask<T>>],
        sinks: &[Arc<dyn SinkTask<T>>],
        qos: Qos,
        store: Arc<dyn Store>,
        interval: Duration,
        ctx: StreamContext,
    ) -> Self {
        tracing::info!("create new coordinator for rule {}", rule_id);
        let (signal_tx, signal_rx) = bounded::<Signal>(SIGNAL_CAPACITY);
        let (force_tx, force_rx) = bounded::<Sender<bool>>(4);

        let mut all_responders: Vec<Arc<dyn Responder>> = Vec::new();
        let mut source_responders: Vec<Arc<dyn Responder>> = Vec::new();
        for s in sources {
            s.set_qos(qos);
            let re: Arc<dyn Responder> = Arc::new(ResponderExecutor::new(
                signal_tx.clone(),
                TaskRole::Source(Arc::clone(s)),
            ));
            all_responders.push(Arc::clone(&re));
            source_responders.push(re);
        }
        for op in operators {
            op.set_qos(qos);
            let re: Arc<dyn Responder> = Arc::new(ResponderExecutor::new(
                signal_tx.clone(),
                TaskRole::Operator(Arc::clone(op)),
            ));
            if let Some(mut handler) =
                create_barrier_handler(Arc::clone(&re), op.input_count(), qos, signal_tx.clone())
            {
                handler.set_output(op.input_sender());
                op.set_barrier_handler(handler);
            }
            all_responders.push(re);
        }
        for sink in sinks {
            sink.set_qos(qos);
            let re: Arc<dyn Responder> = Arc::new(ResponderExecutor::new(
                signal_tx.clone(),
                TaskRole::Sink(Arc::clone(sink)),
            ));
            sink.set_barrier_handler(BarrierHandler::tracker(
                Arc::clone(&re),
                sink.input_count(),
            ));
            all_responders.push(re);
        }

        let base_interval = if interval.is_zero() {
            DEFAULT_CHECKPOINT_INTERVAL
        } else {
            interval
        };

        Self {
            rule_id: rule_id.to_string(),
            tasks_to_trigger: source_responders,
            tasks_to_wait_for: all_responders,
            sink_tasks: sinks.to_vec(),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            force_tx,
            force_rx: Mutex::new(Some(force_rx)),
            store,
            base_interval,
            ctx,
            activated: AtomicBool::new(false),
            in_force_save: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(Mutex::new(CheckpointStore::new(MAX_COMPLETED_CHECKPOINTS))),
        }
    }

    /// Start the single control thread. It owns the pending checkpoint map
    /// and exits on a `Stop` signal or context cancellation.
    pub fn activate(&self) -> Result<()> {
        let signal_rx = self
            .signal_rx
            .lock()
            .map_err(|_| anyhow!("signal receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("coordinator for rule {} is already activated", self.rule_id))?;
        let force_rx = self
            .force_rx
            .lock()
            .map_err(|_| anyhow!("force receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("coordinator for rule {} is already activated", self.rule_id))?;

        tracing::info!(
            "start checkpoint coordinator for rule {} at {}",
            self.rule_id,
            current_time_millis()
        );

        let ticker = tick(self.base_interval);
        let done = self.ctx.done().clone();
        let mut state = ControlState {
            rule_id: self.rule_id.clone(),
            tasks_to_trigger: self.tasks_to_trigger.clone(),
            tasks_to_wait_for: self.tasks_to_wait_for.clone(),
            sink_tasks: self.sink_tasks.clone(),
            signal_tx: self.signal_tx.clone(),
            store: Arc::clone(&self.store),
            completed: Arc::clone(&self.completed),
            in_force_save: Arc::clone(&self.in_force_save),
            pending: HashMap::new(),
            to_be_clean: 0,
            force: None,
        };

        thread::spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        // A forced save is in flight; do not pile a
                        // periodic checkpoint on top of it.
                        if state.in_force_save.load(Ordering::SeqCst) {
                            continue;
                        }
                        state.save_state(current_time_millis());
                    }
                    recv(signal_rx) -> sig => match sig {
                        Ok(s) => match s.message {
                            SignalMessage::Stop => {
                                tracing::debug!(
                                    "stop checkpoint scheduler for rule {}",
                                    state.rule_id
                                );
                                break;
                            }
                            SignalMessage::Ack => state.handle_ack(&s.barrier),
                            SignalMessage::Dec => state.handle_dec(&s.barrier),
                        },
                        Err(_) => break,
                    },
                    recv(force_rx) -> req => {
                        if let Ok(reply) = req {
                            let checkpoint_id = current_time_millis();
                            state.save_state(checkpoint_id);
                            state.force = Some((checkpoint_id, reply));
                        }
                    }
                    recv(done) -> _ => {
                        tracing::info!("cancelling coordinator for rule {}", state.rule_id);
                        break;
                    }
                }
            }
            state.resolve_force_on_exit();
        });

        self.activated.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the control loop. Idempotent with the cancellation path.
    pub fn deactivate(&self) -> Result<()> {
        if self.signal_tx.try_send(Signal::stop()).is_err() {
            tracing::debug!("coordinator for rule {} already stopped", self.rule_id);
        }
        Ok(())
    }

    /// Take one last checkpoint before rule shutdown. Returns a channel
    /// that receives exactly one value (success flag) once the forced
    /// checkpoint resolves. Fails while another force-save is in flight.
    pub fn force_save_state(&self) -> Result<Receiver<bool>> {
        if !self.activated.load(Ordering::SeqCst) {
            bail!("coordinator for rule {} is not activated", self.rule_id);
        }
        if self.in_force_save.swap(true, Ordering::SeqCst) {
            bail!("duplicated force save state");
        }
        let (reply_tx, reply_rx) = bounded::<bool>(1);
        if self.force_tx.send(reply_tx).is_err() {
            self.in_force_save.store(false, Ordering::SeqCst);
            bail!("coordinator for rule {} already stopped", self.rule_id);
        }
        Ok(reply_rx)
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Number of completed checkpoints currently retained.
    pub fn get_complete_count(&self) -> usize {
        self.completed.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Id of the most recently completed checkpoint, if any.
    pub fn get_latest(&self) -> Option<CheckpointId> {
        self.completed.lock().ok().and_then(|g| g.latest())
    }

    /// Retained completed checkpoint ids in completion order.
    pub fn completed_ids(&self) -> Vec<CheckpointId> {
        self.completed.lock().map(|g| g.ids()).unwrap_or_default()
    }
}

/// All coordinator state owned by the control thread. Methods here run on
/// that thread only, which is what keeps the pending map single-writer.
struct ControlState<T: StreamData> {
    rule_id: String,
    tasks_to_trigger: Vec<Arc<dyn Responder>>,
    tasks_to_wait_for: Vec<Arc<dyn Responder>>,
    sink_tasks: Vec<Arc<dyn SinkTask<T>>>,
    signal_tx: Sender<Signal>,
    store: Arc<dyn Store>,
    completed: Arc<Mutex<CheckpointStore>>,
    in_force_save: Arc<AtomicBool>,
    pending: HashMap<CheckpointId, PendingCheckpoint>,
    to_be_clean: usize,
    force: Option<(CheckpointId, Sender<bool>)>,
}

impl<T: StreamData> ControlState<T> {
    /// Trigger a checkpoint: register the pending entry and ask every
    /// source responder to emit its barrier. Trigger failures come back as
    /// `Dec` signals so all bookkeeping stays on this thread.
    fn save_state(&mut self, checkpoint_id: CheckpointId) {
        if self.pending.contains_key(&checkpoint_id) {
            tracing::debug!(
                "checkpoint {} is already pending, skip trigger",
                checkpoint_id
            );
        } else {
            tracing::debug!("create checkpoint {}", checkpoint_id);
            self.pending.insert(
                checkpoint_id,
                PendingCheckpoint::new(checkpoint_id, &self.tasks_to_wait_for),
            );
            for responder in &self.tasks_to_trigger {
                let responder = Arc::clone(responder);
                let signal_tx = self.signal_tx.clone();
                thread::spawn(move || {
                    if let Err(e) = responder.trigger_checkpoint(checkpoint_id) {
                        tracing::info!(
                            "fail to trigger checkpoint for source {} with error {}, cancel it",
                            responder.name(),
                            e
                        );
                        let _ = signal_tx
                            .send(Signal::dec(Barrier::new(checkpoint_id, responder.name())));
                    }
                });
            }
        }

        self.to_be_clean += 1;
        if self.to_be_clean >= CLEAN_THRESHOLD {
            if let Err(e) = self.store.clean() {
                tracing::warn!("store clean for rule {} failed: {}", self.rule_id, e);
            }
            self.to_be_clean = 0;
        }
    }

    fn handle_ack(&mut self, barrier: &Barrier) {
        tracing::debug!(
            "receive ack from {} for checkpoint {}",
            barrier.op_id,
            barrier.checkpoint_id
        );
        match self.pending.get_mut(&barrier.checkpoint_id) {
            Some(cp) => {
                cp.ack(&barrier.op_id);
                let fully_acked = cp.is_fully_acked();
                if fully_acked && self.complete(barrier.checkpoint_id) {
                    self.try_resolve_force(barrier.checkpoint_id, true);
                }
            }
            None => tracing::debug!(
                "receive ack from {} for non existing checkpoint {}",
                barrier.op_id,
                barrier.checkpoint_id
            ),
        }
    }

    fn handle_dec(&mut self, barrier: &Barrier) {
        tracing::debug!(
            "receive dec from {} for checkpoint {}, cancel it",
            barrier.op_id,
            barrier.checkpoint_id
        );
        self.cancel(barrier.checkpoint_id);
        self.try_resolve_force(barrier.checkpoint_id, false);
    }

    /// Persist the checkpoint, move it to the completed ring, and abandon
    /// every older still-pending checkpoint. Returns whether completion
    /// actually happened.
    fn complete(&mut self, checkpoint_id: CheckpointId) -> bool {
        if !self.pending.contains_key(&checkpoint_id) {
            tracing::info!("cannot find checkpoint {} to complete", checkpoint_id);
            return false;
        }
        if let Err(e) = self.store.save_checkpoint(checkpoint_id) {
            // Leave the entry pending; the next periodic tick starts a
            // fresh checkpoint rather than retrying this id.
            tracing::warn!(
                "cannot save checkpoint {} due to storage error: {}",
                checkpoint_id,
                e
            );
            return false;
        }
        let cp = match self.pending.remove(&checkpoint_id) {
            Some(cp) => cp,
            None => return false,
        };
        match self.completed.lock() {
            Ok(mut guard) => guard.add(cp.finalize()),
            Err(_) => tracing::error!("completed checkpoint store lock poisoned"),
        }
        let stale: Vec<CheckpointId> = self
            .pending
            .keys()
            .filter(|cid| **cid < checkpoint_id)
            .copied()
            .collect();
        for cid in stale {
            if let Some(mut old) = self.pending.remove(&cid) {
                old.dispose();
            }
        }
        for sink in &self.sink_tasks {
            sink.save_cache();
        }
        tracing::debug!("totally complete checkpoint {}", checkpoint_id);
        true
    }

    /// Discard a pending checkpoint. Tolerant of the checkpoint no longer
    /// existing, so a double cancel is a no-op.
    fn cancel(&mut self, checkpoint_id: CheckpointId) {
        match self.pending.remove(&checkpoint_id) {
            Some(mut cp) => cp.dispose(),
            None => tracing::debug!(
                "cancel for non existing checkpoint {}, just ignored",
                checkpoint_id
            ),
        }
    }

    fn try_resolve_force(&mut self, checkpoint_id: CheckpointId, success: bool) {
        let resolved = match &self.force {
            Some((forced_id, _)) => checkpoint_id >= *forced_id,
            None => false,
        };
        if resolved {
            if let Some((_, reply)) = self.force.take() {
                let _ = reply.send(success);
            }
            self.in_force_save.store(false, Ordering::SeqCst);
        }
    }

    fn resolve_force_on_exit(&mut self) {
        if let Some((_, reply)) = self.force.take() {
            let _ = reply.send(false);
            self.in_force_save.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
