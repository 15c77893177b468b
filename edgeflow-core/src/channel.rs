//! Bounded channels for inter-node communication.
//!
//! Uses crossbeam-channel for bounded, backpressure-aware communication
//! between node worker threads. Every item carries the name of the emitting
//! task so fan-in consumers can attribute it to an input channel.

use crate::types::StreamElement;
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::Arc;

/// Default channel buffer size (bounded for backpressure).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An element tagged with the name of the task that emitted it.
///
/// Fan-in operators route every upstream into one physical input channel;
/// the `channel` tag is what barrier alignment keys its blocked-channel
/// set on.
#[derive(Debug, Clone)]
pub struct ChannelItem<T> {
    pub channel: Arc<str>,
    pub element: StreamElement<T>,
}

impl<T> ChannelItem<T> {
    pub fn new(channel: Arc<str>, element: StreamElement<T>) -> Self {
        Self { channel, element }
    }
}

/// Sender side of an inter-node channel.
#[derive(Clone)]
pub struct ChannelSender<T> {
    sender: Sender<ChannelItem<T>>,
}

impl<T> ChannelSender<T> {
    /// Send an item, blocking if the channel is full (backpressure).
    pub fn send(&self, item: ChannelItem<T>) -> Result<()> {
        self.sender
            .send(item)
            .map_err(|_| anyhow!("channel closed: receiver dropped"))
    }

    /// Try to send without blocking. Errors if the channel is full or closed.
    pub fn try_send(&self, item: ChannelItem<T>) -> Result<()> {
        self.sender
            .try_send(item)
            .map_err(|e| anyhow!("failed to send: {:?}", e))
    }
}

/// Receiver side of an inter-node channel.
pub struct ChannelReceiver<T> {
    pub(crate) receiver: Receiver<ChannelItem<T>>,
}

impl<T> ChannelReceiver<T> {
    /// Receive the next item, blocking until one is available.
    pub fn recv(&self) -> Result<ChannelItem<T>> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("channel closed: all senders dropped"))
    }

    /// Try to receive without blocking. Returns `None` if empty.
    pub fn try_recv(&self) -> Result<Option<ChannelItem<T>>> {
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Err(anyhow!("channel closed: all senders dropped"))
            }
        }
    }
}

/// Create a bounded inter-node channel pair.
///
/// When the channel is full, `send()` blocks until space is available,
/// propagating backpressure through the pipeline.
pub fn item_channel<T>(capacity: usize) -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (sender, receiver) = bounded(capacity);
    (ChannelSender { sender }, ChannelReceiver { receiver })
}

/// Create an inter-node channel with default capacity.
pub fn item_channel_default<T>() -> (ChannelSender<T>, ChannelReceiver<T>) {
    item_channel(DEFAULT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(channel: &str, value: i32) -> ChannelItem<i32> {
        ChannelItem::new(Arc::from(channel), StreamElement::record(value))
    }

    #[test]
    fn test_channel_send_recv() {
        let (tx, rx) = item_channel::<i32>(10);
        tx.send(record("src", 42)).unwrap();

        let item = rx.recv().unwrap();
        assert_eq!(&*item.channel, "src");
        match item.element {
            StreamElement::Record(v) => assert_eq!(v, 42),
            _ => panic!("expected record"),
        }
    }

    #[test]
    fn test_channel_backpressure() {
        let (tx, rx) = item_channel::<i32>(2);
        tx.send(record("a", 1)).unwrap();
        tx.send(record("a", 2)).unwrap();

        assert!(tx.try_send(record("a", 3)).is_err());

        rx.recv().unwrap();
        tx.try_send(record("a", 3)).unwrap();
    }

    #[test]
    fn test_channel_closed() {
        let (tx, rx) = item_channel::<i32>(10);
        tx.send(record("a", 1)).unwrap();
        drop(tx);

        assert!(rx.recv().is_ok());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_try_recv_empty() {
        let (_tx, rx) = item_channel::<i32>(1);
        assert!(rx.try_recv().unwrap().is_none());
    }
}
