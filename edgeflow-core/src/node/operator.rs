//! Operator nodes: interior pipeline stages.
//!
//! The worker loop routes every incoming item through the node's barrier
//! handler first (when one is installed by the coordinator); consumed
//! items never reach the operator logic. Barriers arriving without a
//! handler are forwarded untouched, which is what lets a shared
//! sub-topology's interior operators stay out of a consuming rule's
//! checkpoint accounting.

use crate::channel::ChannelSender;
use crate::checkpoint::{BarrierHandler, NonSourceTask, StreamTask};
use crate::context::StreamContext;
use crate::node::{Emitter, InputState, NodeState};
use crate::types::{Qos, StreamData, StreamElement};
use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A stateless-or-ctx-stateful transformation applied to each record.
pub trait Operator<T: StreamData>: Send {
    fn process(&mut self, input: T, ctx: &StreamContext) -> Result<Vec<T>>;
}

/// Adapter turning a closure into an [`Operator`].
pub struct FnOperator<T, F> {
    f: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T, F> Operator<T> for FnOperator<T, F>
where
    T: StreamData,
    F: FnMut(T, &StreamContext) -> Result<Vec<T>> + Send,
{
    fn process(&mut self, input: T, ctx: &StreamContext) -> Result<Vec<T>> {
        (self.f)(input, ctx)
    }
}

/// Box a closure as an operator.
pub fn fn_operator<T, F>(f: F) -> Box<dyn Operator<T>>
where
    T: StreamData,
    F: FnMut(T, &StreamContext) -> Result<Vec<T>> + Send + 'static,
{
    Box::new(FnOperator {
        f,
        _marker: PhantomData,
    })
}

/// Pipeline node wrapping an [`Operator`] implementation.
pub struct OperatorNode<T: StreamData> {
    base: NodeState<T>,
    input: InputState<T>,
    op: Mutex<Option<Box<dyn Operator<T>>>>,
}

impl<T: StreamData> OperatorNode<T> {
    pub fn new(name: &str, op: Box<dyn Operator<T>>) -> Arc<Self> {
        Arc::new(Self {
            base: NodeState::new(name),
            input: InputState::new(),
            op: Mutex::new(Some(op)),
        })
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Start the operator worker thread.
    pub fn open(
        self: &Arc<Self>,
        ctx: StreamContext,
        err_tx: Sender<anyhow::Error>,
    ) -> Result<JoinHandle<()>> {
        let mut op = self
            .op
            .lock()
            .map_err(|_| anyhow!("operator lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("operator {} already opened", self.base.name()))?;
        let rx = self.input.take_receiver()?;
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
                    StreamElement::Record(value) => match op.process(value, &ctx) {
                        Ok(outputs) => {
                            let mut closed = false;
                            for out in outputs {
                                if node.base.broadcast(StreamElement::record(out)).is_err() {
                                    closed = true;
                                    break;
                                }
                            }
                            if closed {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                "operator {} process error: {}",
                                node.base.name(),
                                e
                            );
                            let _ = err_tx.try_send(e);
                        }
                    },
                    StreamElement::Barrier(b) => {
                        // No handler installed for this rule; pass the
                        // barrier along so downstream alignment still sees
                        // it.
                        if node.base.broadcast(StreamElement::Barrier(b)).is_err() {
                            break;
                        }
                    }
                    StreamElement::End => {
                        let _ = node.base.broadcast(StreamElement::End);
                        break;
                    }
                }
            }
        });
        Ok(handle)
    }
}

impl<T: StreamData> StreamTask<T> for OperatorNode<T> {
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

impl<T: StreamData> NonSourceTask<T> for OperatorNode<T> {
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

impl<T: StreamData> Emitter<T> for OperatorNode<T> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn add_output(&self, output: ChannelSender<T>, name: &str) -> Result<()> {
        self.base.add_output(output, name)
    }
}
