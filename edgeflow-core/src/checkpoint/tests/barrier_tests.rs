use super::*;
use crate::channel::{item_channel, ChannelItem};
use crate::checkpoint::responder::Responder;
use crate::types::{CheckpointId, SignalMessage, StreamElement};
use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockResponder {
    name: String,
    triggered: Mutex<Vec<CheckpointId>>,
    fail: bool,
}

impl MockResponder {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            triggered: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn triggered(&self) -> Vec<CheckpointId> {
        self.triggered.lock().unwrap().clone()
    }
}

impl Responder for MockResponder {
    fn trigger_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<()> {
        if self.fail {
            return Err(anyhow!("mock trigger failure"));
        }
        self.triggered.lock().unwrap().push(checkpoint_id);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn record(channel: &str, value: i32) -> ChannelItem<i32> {
    ChannelItem::new(Arc::from(channel), StreamElement::record(value))
}

fn barrier_item(channel: &str, checkpoint_id: CheckpointId) -> ChannelItem<i32> {
    ChannelItem::new(
        Arc::from(channel),
        StreamElement::barrier(checkpoint_id, channel),
    )
}

#[test]
fn test_tracker_single_input_triggers_immediately() {
    let responder = MockResponder::new("op");
    let mut handler: BarrierHandler<i32> = BarrierHandler::tracker(responder.clone(), 1);

    assert!(handler.process(barrier_item("a", 5)).is_none());
    assert_eq!(responder.triggered(), vec![5]);
}

#[test]
fn test_tracker_passes_records_through() {
    let responder = MockResponder::new("op");
    let mut handler: BarrierHandler<i32> = BarrierHandler::tracker(responder.clone(), 2);

    let out = handler.process(record("a", 42)).expect("record forwarded");
    assert!(matches!(out.element, StreamElement::Record(42)));
    assert!(responder.triggered().is_empty());
}

#[test]
fn test_tracker_multi_input_counting() {
    let responder = MockResponder::new("op");
    let mut handler: BarrierHandler<i32> = BarrierHandler::tracker(responder.clone(), 3);

    // An older checkpoint gets one barrier in before checkpoint 10 starts.
    assert!(handler.process(barrier_item("a", 5)).is_none());

    assert!(handler.process(barrier_item("a", 10)).is_none());
    assert!(handler.process(barrier_item("b", 10)).is_none());
    assert!(responder.triggered().is_empty());

    assert!(handler.process(barrier_item("c", 10)).is_none());
    assert_eq!(responder.triggered(), vec![10]);

    // Counts for checkpoint 5 were reset along with checkpoint 10; two
    // more barriers are not enough to reach the input count again.
    assert!(handler.process(barrier_item("b", 5)).is_none());
    assert!(handler.process(barrier_item("c", 5)).is_none());
    assert_eq!(responder.triggered(), vec![10]);
}

#[test]
fn test_aligner_single_input_fast_path() {
    let responder = MockResponder::new("op");
    let (signal_tx, _signal_rx) = bounded(16);
    let mut handler: BarrierHandler<i32> = BarrierHandler::aligner(responder.clone(), 1, signal_tx);

    assert!(handler.process(barrier_item("a", 10)).is_none());
    assert_eq!(responder.triggered(), vec![10]);

    // Stale and duplicate barriers are ignored.
    assert!(handler.process(barrier_item("a", 10)).is_none());
    assert!(handler.process(barrier_item("a", 9)).is_none());
    assert_eq!(responder.triggered(), vec![10]);
}

#[test]
fn test_aligner_blocks_and_replays_in_order() {
    let responder = MockResponder::new("op");
    let (signal_tx, _signal_rx) = bounded(16);
    let (out_tx, out_rx) = item_channel::<i32>(16);
    let mut handler: BarrierHandler<i32> = BarrierHandler::aligner(responder.clone(), 2, signal_tx);
    handler.set_output(out_tx);

    // Checkpoint 7 arrives on "a" only; "a" is now blocked.
    assert!(handler.process(barrier_item("a", 7)).is_none());

    // Records on the blocked channel are buffered, not forwarded.
    assert!(handler.process(record("a", 1)).is_none());
    assert!(handler.process(record("a", 2)).is_none());

    // Records on the unblocked channel keep flowing.
    let forwarded = handler.process(record("b", 3)).expect("b not blocked");
    assert!(matches!(forwarded.element, StreamElement::Record(3)));
    assert!(responder.triggered().is_empty());

    // Barrier on "b" completes the alignment.
    assert!(handler.process(barrier_item("b", 7)).is_none());
    assert_eq!(responder.triggered(), vec![7]);

    // Buffered records replay in original receipt order.
    let r1 = out_rx.receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    let r2 = out_rx.receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(r1.element, StreamElement::Record(1)));
    assert!(matches!(r2.element, StreamElement::Record(2)));

    // Blocks are released afterwards.
    let after = handler.process(record("a", 4)).expect("a released");
    assert!(matches!(after.element, StreamElement::Record(4)));
}

#[test]
fn test_aligner_preemption_cancels_old_checkpoint() {
    let responder = MockResponder::new("op");
    let (signal_tx, signal_rx) = bounded(16);
    let (out_tx, out_rx) = item_channel::<i32>(16);
    let mut handler: BarrierHandler<i32> = BarrierHandler::aligner(responder.clone(), 2, signal_tx);
    handler.set_output(out_tx);

    // Aligning checkpoint 7, with one record buffered on "a".
    assert!(handler.process(barrier_item("a", 7)).is_none());
    assert!(handler.process(record("a", 1)).is_none());

    // A newer barrier preempts the old alignment and cancels it.
    assert!(handler.process(barrier_item("b", 9)).is_none());
    let signal = signal_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(signal.message, SignalMessage::Dec);
    assert_eq!(signal.barrier.checkpoint_id, 7);
    assert!(responder.triggered().is_empty());

    // The new alignment completes once "a" presents checkpoint 9; the
    // record buffered under the abandoned alignment is not lost.
    assert!(handler.process(barrier_item("a", 9)).is_none());
    assert_eq!(responder.triggered(), vec![9]);
    let replayed = out_rx.receiver.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(matches!(replayed.element, StreamElement::Record(1)));
}

#[test]
fn test_aligner_ignores_stale_barrier_while_aligning() {
    let responder = MockResponder::new("op");
    let (signal_tx, signal_rx) = bounded(16);
    let mut handler: BarrierHandler<i32> = BarrierHandler::aligner(responder.clone(), 2, signal_tx);

    assert!(handler.process(barrier_item("a", 10)).is_none());
    // A barrier from an already superseded checkpoint changes nothing.
    assert!(handler.process(barrier_item("b", 4)).is_none());
    assert!(responder.triggered().is_empty());
    assert!(signal_rx.try_recv().is_err());

    assert!(handler.process(barrier_item("b", 10)).is_none());
    assert_eq!(responder.triggered(), vec![10]);
}
