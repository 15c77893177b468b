//! Sink nodes: the exits of a rule pipeline.

use crate::channel::ChannelSender;
use crate::checkpoint::{BarrierHandler, NonSourceTask, SinkTask, StreamTask};
use crate::context::StreamContext;
use crate::node::{InputState, NodeState};
use crate::types::{Qos, StreamData, StreamElement};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A data consumer driven by a [`SinkNode`] worker thread.
pub trait Sink<T: StreamData>: Send {
    fn collect(&mut self, item: T, ctx: &StreamContext) -> Result<()>;

    /// Persist any resend cache the sink keeps. Invoked when a checkpoint
    /// completes.
    fn save_cache(&mut self, _ctx: &StreamContext) -> Result<()> {
        Ok(())
    }
}

/// Pipeline node wrapping a [`Sink`] implementation.
pub struct SinkNode<T: StreamData> {
    base: NodeState<T>,
    input: InputState<T>,
    sink: Mutex<Option<Box<dyn Sink<T>>>>,
    cache_tx: Sender<()>,
    cache_rx: Mutex<Option<Receiver<()>>>,
}

impl<T: StreamData> SinkNode<T> {
    pub fn new(name: &str, sink: Box<dyn Sink<T>>) -> Arc<Self> {
        let (cache_tx, cache_rx) = bounded(1);
        Arc::new(Self {
            base: NodeState::new(name),
            input: InputState::new(),
            sink: Mutex::new(Some(sink)),
            cache_tx,
            cache_rx: Mutex::new(Some(cache_rx)),
        })
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Start the sink worker thread.
    pub fn open(
        self: &Arc<Self>,
        ctx: StreamContext,
        err_tx: Sender<anyhow::Error>,
    ) -> Result<JoinHandle<()>> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow!("sink lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("sink {} already opened", self.base.name()))?;
        let rx = self.input.take_receiver()?;
        let cache_rx = self
            .cache_rx
            .lock()
            .map_err(|_| anyhow!("cache receiver lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("sink {} already opened", self.base.name()))?;
        let mut handler = self.input.take_handler();
        self.base.set_ctx(ctx.clone());

        let node = Arc::clone(self);
        let handle = thread::spawn(move || {
            let done = ctx.done().clone();
            loop {
                let item = crossbeam_channel::select! {
                    recv(rx.receiver) -> item => match item {
                        Ok(item) => item,
                        Err(_) => break,
                    },
                    recv(cache_rx) -> req => {
                        if req.is_ok() {
                            if let Err(e) = sink.save_cache(&ctx) {
                                tracing::warn!(
                                    "sink {} save cache failed: {}",
                                    node.base.name(),
                                    e
                                );
                            }
                        }
                        continue;
                    },
                    recv(done) -> _ => break,
                };

                let item = match handler.as_mut() {
                    Some(h) => match h.process(item) {
                        Some(item) => item,
                        None => continue,
                    },
                    None => item,
                };

                match item.element {
                    StreamElement::Record(value) => {
                        if let Err(e) = sink.collect(value, &ctx) {
                            tracing::error!("sink {} collect error: {}", node.base.name(), e);
                            let _ = err_tx.try_send(e);
                        }
                    }
                    StreamElement::Barrier(_) => {
                        // Checkpointing disabled on this rule; nothing to
                        // forward from a sink.
                    }
                    StreamElement::End => break,
                }
            }
        });
        Ok(handle)
    }
}

impl<T: StreamData> StreamTask<T> for SinkNode<T> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn stream_context(&self) -> Option<StreamContext> {
        self.base.context()
    }

    fn broadcast(&self, element: StreamElement<T>) -> Result<()> {
        self.base.broadcast(element)
    }

    fn set_qos(&self, qos: Qos) {
        self.base.set_qos(qos);
    }
}

impl<T: StreamData> NonSourceTask<T> for SinkNode<T> {
    fn input_count(&self) -> usize {
        self.input.input_count()
    }

    fn add_input_count(&self) {
        self.input.add_input_count();
    }

    fn set_barrier_handler(&self, handler: BarrierHandler<T>) {
        self.input.set_handler(handler);
    }

    fn input_sender(&self) -> ChannelSender<T> {
        self.input.input_sender()
    }
}

impl<T: StreamData> SinkTask<T> for SinkNode<T> {
    fn save_cache(&self) {
        // Only meaningful when the rule checkpoints at all. Coalesces: a
        // full buffer means a save request is already queued.
        if self.base.qos() == Qos::AtMostOnce {
            return;
        }
        let _ = self.cache_tx.try_send(());
    }
}

/// Sink that appends every record to a shared vector. Used by tests and
/// local demos.
pub struct CollectSink<T: StreamData> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: StreamData> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected records.
    pub fn collected(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

impl<T: StreamData> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StreamData> Sink<T> for CollectSink<T> {
    fn collect(&mut self, item: T, _ctx: &StreamContext) -> Result<()> {
        self.items
            .lock()
            .map_err(|_| anyhow!("collect sink lock poisoned"))?
            .push(item);
        Ok(())
    }
}
