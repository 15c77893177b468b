//! Checkpointed rule pipeline demo.
//!
//! Builds a small rule (number source -> running total -> log sink) with
//! at-least-once delivery and a fast checkpoint interval, lets it run for
//! a couple of seconds, then shuts it down with a final forced save.

use anyhow::Result;
use edgeflow_core::context::StreamContext;
use edgeflow_core::node::{fn_operator, ChannelSource, OperatorNode, Sink, SinkNode, SourceNode};
use edgeflow_core::store::InMemoryStore;
use edgeflow_core::topo::{DataSource, Topology};
use edgeflow_core::types::Qos;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct LogSink;

impl Sink<i64> for LogSink {
    fn collect(&mut self, item: i64, ctx: &StreamContext) -> Result<()> {
        tracing::info!("rule {} emits running total {}", ctx.rule_id(), item);
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let (feed, feed_rx) = crossbeam_channel::bounded::<i64>(64);
    let source = SourceNode::new("numbers", Box::new(ChannelSource::new(feed_rx)));
    let totals = OperatorNode::new(
        "running_total",
        fn_operator(|v: i64, ctx: &StreamContext| {
            let total = ctx.incr_counter("total", v)?;
            Ok(vec![total])
        }),
    );
    let sink = SinkNode::new("log", Box::new(LogSink));

    let mut topo: Topology<i64> =
        Topology::new("demo_rule", Qos::AtLeastOnce, Duration::from_millis(500));
    let store = Arc::new(InMemoryStore::new());
    topo.with_store(store.clone());
    topo.set_save_state_before_stop(true);
    topo.add_src(DataSource::Node(Arc::clone(&source)));
    topo.add_operator(
        &[source.as_ref() as &dyn edgeflow_core::node::Emitter<i64>],
        Arc::clone(&totals),
    )?;
    topo.add_sink(
        &[totals.as_ref() as &dyn edgeflow_core::node::Emitter<i64>],
        sink,
    )?;

    topo.open()?;

    // Feed a slow trickle of numbers while checkpoints run underneath.
    let producer = thread::spawn(move || {
        for i in 1..=100 {
            if feed.send(i).is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }
    });

    thread::sleep(Duration::from_secs(2));

    if let Some(coordinator) = topo.get_coordinator() {
        tracing::info!(
            "completed {} checkpoints, latest {:?}",
            coordinator.get_complete_count(),
            coordinator.get_latest()
        );
    }

    topo.cancel();
    topo.wait_close();
    let _ = producer.join();

    tracing::info!(
        "durably recorded checkpoints: {:?}",
        store.saved_checkpoints()
    );
    Ok(())
}
