use super::*;
use crate::node::{fn_operator, ChannelSource, CollectSink, OperatorNode, SinkNode, SourceNode};
use crate::store::InMemoryStore;
use crate::topo::{DataSource, Topology};
use std::time::Duration;

fn shared_chain(
    feed_capacity: usize,
) -> (
    crossbeam_channel::Sender<i64>,
    Arc<SourceNode<i64>>,
    Vec<Arc<OperatorNode<i64>>>,
) {
    let (tx, rx) = bounded(feed_capacity);
    let source = SourceNode::new("shared_src", Box::new(ChannelSource::new(rx)));
    let ops = vec![OperatorNode::new(
        "pre",
        fn_operator(|v: i64, _ctx| Ok(vec![v + 1])),
    )];
    (tx, source, ops)
}

#[test]
fn test_pool_shares_one_instance() {
    let pool: SubTopoPool<i64> = SubTopoPool::new();
    let (_feed, source, ops) = shared_chain(16);

    let (first, existed) = pool
        .get_or_create("shared", move || (source, ops))
        .unwrap();
    assert!(!existed);
    assert_eq!(first.ops_count(), 1);
    assert_eq!(pool.len(), 1);

    let (second, existed) = pool
        .get_or_create("shared", || panic!("builder must not run for an existing entry"))
        .unwrap();
    assert!(existed);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.len(), 1);
}

#[test]
fn test_ref_counting_and_teardown() {
    let pool: SubTopoPool<i64> = SubTopoPool::new();
    let (_feed, source, ops) = shared_chain(16);
    let (subtopo, _) = pool.get_or_create("shared", move || (source, ops)).unwrap();

    let (ctx1, _cancel1) = StreamContext::with_cancel("rule1");
    let (err_tx1, _err_rx1) = bounded(4);
    subtopo.open(&ctx1, err_tx1.clone()).unwrap();
    assert_eq!(subtopo.ref_count(), 1);
    assert!(subtopo.is_opened());

    let (ctx2, _cancel2) = StreamContext::with_cancel("rule2");
    let (err_tx2, _err_rx2) = bounded(4);
    subtopo.open(&ctx2, err_tx2).unwrap();
    assert_eq!(subtopo.ref_count(), 2);

    // Re-opening from a rule that already holds a reference is a no-op.
    subtopo.open(&ctx1, err_tx1).unwrap();
    assert_eq!(subtopo.ref_count(), 2);

    subtopo.close("rule1");
    assert_eq!(subtopo.ref_count(), 1);
    assert!(pool.get("shared").is_some());
    assert!(subtopo.is_opened());

    // Closing an unknown rule changes nothing.
    subtopo.close("rule_unknown");
    assert_eq!(subtopo.ref_count(), 1);

    subtopo.close("rule2");
    assert_eq!(subtopo.ref_count(), 0);
    assert!(pool.get("shared").is_none());
    std::thread::sleep(Duration::from_millis(100));
    assert!(!subtopo.is_opened());
}

#[test]
fn test_shared_subtopo_spliced_into_rule_checkpoint() {
    let pool: SubTopoPool<i64> = SubTopoPool::new();
    let (feed, source, ops) = shared_chain(64);
    let (subtopo, _) = pool
        .get_or_create("shared_stream", move || (source, ops))
        .unwrap();

    let agg = OperatorNode::new(
        "agg",
        fn_operator(|v: i64, ctx: &StreamContext| {
            let total = ctx.incr_counter("sum", v)?;
            Ok(vec![total])
        }),
    );
    let sink_impl = CollectSink::new();
    let collected = sink_impl.collected();
    let sink = SinkNode::new("out", Box::new(sink_impl));

    let mut topo: Topology<i64> =
        Topology::new("rule_shared", Qos::AtLeastOnce, Duration::from_millis(100));
    let store = Arc::new(InMemoryStore::new());
    topo.with_store(store.clone());
    topo.add_src(DataSource::SubTopo(Arc::clone(&subtopo)));
    topo.add_operator(&[subtopo.as_ref() as &dyn Emitter<i64>], Arc::clone(&agg))
        .unwrap();
    topo.add_sink(&[agg.as_ref() as &dyn Emitter<i64>], sink).unwrap();

    topo.open().unwrap();
    feed.send(1).unwrap();
    feed.send(2).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    let coordinator = topo.get_coordinator().expect("checkpointing enabled");
    assert!(coordinator.get_complete_count() >= 1);
    let latest = coordinator.get_latest().expect("completed checkpoint");

    // The rule's own operator and sink snapshot into the rule store. The
    // sub-topology's interior operator is bypassed: only the shared source
    // is part of the rule's checkpoint accounting, and it persists through
    // the sub-topology's own store.
    assert!(store.state_for(latest, "agg").is_some());
    assert!(store.state_for(latest, "out").is_some());
    assert!(store.state_for(latest, "pre").is_none());
    assert!(store.state_for(latest, "shared_src").is_none());

    // Records pass through the shared prefix: (1+1), then (2+1) summed.
    assert_eq!(*collected.lock().unwrap(), vec![2, 5]);

    // The rule going away releases the last reference.
    topo.cancel();
    assert!(pool.get("shared_stream").is_none());
    topo.wait_close();
}
