use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for checkpoints: the unix-millis timestamp at trigger
/// time. Monotonically non-decreasing, ordered by `<`.
pub type CheckpointId = i64;

/// Current wall clock in milliseconds since epoch.
pub fn current_time_millis() -> CheckpointId {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as CheckpointId)
        .unwrap_or(0)
}

/// Delivery-guarantee level for a rule. Selects how checkpoint barriers are
/// handled on fan-in operators: absent, non-blocking-counted, or
/// blocking-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Checkpoint barrier for Chandy-Lamport snapshots.
///
/// Injected into every output channel of a task when a checkpoint is
/// triggered on it, and routed in-band with ordinary records. `op_id` names
/// the task that broadcast the barrier, which is the input channel identity
/// for the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub checkpoint_id: CheckpointId,
    pub op_id: String,
}

impl Barrier {
    pub fn new(checkpoint_id: CheckpointId, op_id: impl Into<String>) -> Self {
        Self {
            checkpoint_id,
            op_id: op_id.into(),
        }
    }
}

/// Control message carried by a [`Signal`] from a task back to the
/// checkpoint coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalMessage {
    /// Stop the coordinator control loop.
    Stop,
    /// Local snapshot and persistence succeeded.
    Ack,
    /// Local snapshot or persistence failed; cancel the checkpoint.
    Dec,
}

/// Task -> coordinator checkpoint control event, sent on the per-rule
/// signal channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub message: SignalMessage,
    pub barrier: Barrier,
}

impl Signal {
    pub fn ack(barrier: Barrier) -> Self {
        Self {
            message: SignalMessage::Ack,
            barrier,
        }
    }

    pub fn dec(barrier: Barrier) -> Self {
        Self {
            message: SignalMessage::Dec,
            barrier,
        }
    }

    pub fn stop() -> Self {
        Self {
            message: SignalMessage::Stop,
            barrier: Barrier::new(0, ""),
        }
    }
}

/// The fundamental unit flowing through a rule pipeline: data records,
/// checkpoint barriers, and end-of-stream markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamElement<T> {
    /// User data record.
    Record(T),
    /// Checkpoint barrier delimiting "everything before this point belongs
    /// to checkpoint N" on this channel.
    Barrier(Barrier),
    /// End of bounded stream.
    End,
}

impl<T> StreamElement<T> {
    /// Create a record element.
    pub fn record(value: T) -> Self {
        Self::Record(value)
    }

    /// Create a barrier element.
    pub fn barrier(checkpoint_id: CheckpointId, op_id: impl Into<String>) -> Self {
        Self::Barrier(Barrier::new(checkpoint_id, op_id))
    }

    /// Returns `true` if this is a barrier element.
    pub fn is_barrier(&self) -> bool {
        matches!(self, Self::Barrier(_))
    }
}

/// Trait bound for types that can flow through a pipeline.
pub trait StreamData: Send + Clone + Serialize + for<'de> Deserialize<'de> + 'static {}

// Blanket implementation: any type satisfying the bounds is StreamData.
impl<T> StreamData for T where T: Send + Clone + Serialize + for<'de> Deserialize<'de> + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_ordering() {
        assert!(Qos::AtMostOnce < Qos::AtLeastOnce);
        assert!(Qos::AtLeastOnce < Qos::ExactlyOnce);
        assert!(Qos::ExactlyOnce >= Qos::AtLeastOnce);
    }

    #[test]
    fn test_barrier_element() {
        let elem = StreamElement::<i32>::barrier(5, "op_a");
        assert!(elem.is_barrier());
        match elem {
            StreamElement::Barrier(b) => {
                assert_eq!(b.checkpoint_id, 5);
                assert_eq!(b.op_id, "op_a");
            }
            _ => panic!("expected barrier"),
        }
    }

    #[test]
    fn test_signal_constructors() {
        let ack = Signal::ack(Barrier::new(7, "src"));
        assert_eq!(ack.message, SignalMessage::Ack);
        assert_eq!(ack.barrier.checkpoint_id, 7);

        let stop = Signal::stop();
        assert_eq!(stop.message, SignalMessage::Stop);
    }

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_stream_data_trait() {
        fn assert_stream_data<T: StreamData>() {}
        assert_stream_data::<i32>();
        assert_stream_data::<String>();
        assert_stream_data::<(String, i64)>();
    }
}
