//! Source nodes: the entry points of a rule pipeline.

use crate::channel::ChannelSender;
use crate::checkpoint::StreamTask;
use crate::context::StreamContext;
use crate::node::{Emitter, NodeState};
use crate::types::{Qos, StreamData, StreamElement};
use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A data producer driven by a [`SourceNode`] worker thread.
///
/// `open` runs until the stream ends (return `Ok`) or fails (return the
/// error); it must watch `ctx.done()` to stop promptly on rule
/// cancellation.
pub trait Source<T: StreamData>: Send {
    fn open(&mut self, ctx: &StreamContext, collector: &SourceCollector<T>) -> Result<()>;
}

/// Hands produced records to the node's downstream channels.
pub struct SourceCollector<T: StreamData> {
    node: Arc<SourceNode<T>>,
}

impl<T: StreamData> SourceCollector<T> {
    pub fn collect(&self, item: T) -> Result<()> {
        self.node.base.broadcast(StreamElement::record(item))
    }
}

/// Pipeline node wrapping a [`Source`] implementation.
pub struct SourceNode<T: StreamData> {
    base: NodeState<T>,
    source: Mutex<Option<Box<dyn Source<T>>>>,
}

impl<T: StreamData> SourceNode<T> {
    pub fn new(name: &str, source: Box<dyn Source<T>>) -> Arc<Self> {
        Arc::new(Self {
            base: NodeState::new(name),
            source: Mutex::new(Some(source)),
        })
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Start the source worker thread. The error sender reports a failed
    /// source to the rule's drain channel.
    pub fn open(
        self: &Arc<Self>,
        ctx: StreamContext,
        err_tx: Sender<anyhow::Error>,
    ) -> Result<JoinHandle<()>> {
        let mut source = self
            .source
            .lock()
            .map_err(|_| anyhow!("source lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("source {} already opened", self.base.name()))?;
        self.base.set_ctx(ctx.clone());

        let node = Arc::clone(self);
        let handle = thread::spawn(move || {
            let collector = SourceCollector {
                node: Arc::clone(&node),
            };
            match source.open(&ctx, &collector) {
                Ok(()) => {
                    // Bounded stream finished; let downstream drain.
                    if let Err(e) = node.base.broadcast(StreamElement::End) {
                        tracing::debug!("source {} end marker dropped: {}", node.base.name(), e);
                    }
                }
                Err(e) => {
                    if ctx.is_cancelled() {
                        tracing::debug!(
                            "source {} stopped during cancellation: {}",
                            node.base.name(),
                            e
                        );
                    } else {
                        tracing::error!("source {} exited with error: {}", node.base.name(), e);
                        let _ = err_tx.try_send(e);
                    }
                }
            }
        });
        Ok(handle)
    }
}

impl<T: StreamData> StreamTask<T> for SourceNode<T> {
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

impl<T: StreamData> Emitter<T> for SourceNode<T> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn add_output(&self, output: ChannelSender<T>, name: &str) -> Result<()> {
        self.base.add_output(output, name)
    }

    fn is_source(&self) -> bool {
        true
    }
}

/// Source fed from a crossbeam channel. The feeding side closes the
/// channel to end the stream. Used by tests and local demos.
pub struct ChannelSource<T: StreamData> {
    feed: Receiver<T>,
}

impl<T: StreamData> ChannelSource<T> {
    pub fn new(feed: Receiver<T>) -> Self {
        Self { feed }
    }
}

impl<T: StreamData> Source<T> for ChannelSource<T> {
    fn open(&mut self, ctx: &StreamContext, collector: &SourceCollector<T>) -> Result<()> {
        let done = ctx.done().clone();
        loop {
            crossbeam_channel::select! {
                recv(self.feed) -> item => match item {
                    Ok(value) => collector.collect(value)?,
                    Err(_) => return Ok(()),
                },
                recv(done) -> _ => return Ok(()),
            }
        }
    }
}
