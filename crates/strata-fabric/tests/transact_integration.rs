//! Transact integration tests: request/response over loopback fabrics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strata_fabric::{
    Fabric, FabricConfig, FabricError, FieldKind, MsgTemplate, NodeId, PooledMsg, StaticMembership,
    TransactContext,
};

const ECHO_TYPE: u16 = 20;

fn test_config() -> FabricConfig {
    FabricConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..FabricConfig::default()
    }
}

fn echo_template() -> MsgTemplate {
    // field 0 is the fabric-owned transaction id
    MsgTemplate::new(&[FieldKind::U64, FieldKind::U32])
}

/// Responder that replies with the request value plus 1000.
fn echo_responder() -> Arc<dyn strata_fabric::TransactHandler> {
    Arc::new(
        |fabric: &Fabric, _from: NodeId, msg: PooledMsg, ctx: TransactContext| {
            let value = msg.get_u32(1).unwrap();
            drop(msg);
            let mut reply = fabric.msg_pool().acquire(ECHO_TYPE).unwrap();
            reply.set_u32(1, value + 1000).unwrap();
            fabric.transact_reply(reply, ctx).unwrap();
        },
    )
}

fn silent_responder() -> Arc<dyn strata_fabric::TransactHandler> {
    Arc::new(|_fabric: &Fabric, _from: NodeId, _msg: PooledMsg, _ctx: TransactContext| {})
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transacts_complete_without_cross_talk() {
    let membership = Arc::new(StaticMembership::new());
    let node_a = NodeId(1);
    let node_b = NodeId(2);

    let fabric_b = Fabric::new(node_b, test_config(), membership.clone());
    fabric_b
        .transact_register(ECHO_TYPE, echo_template(), 64, echo_responder())
        .unwrap();
    fabric_b.start().await.unwrap();
    membership.add_node(node_b, fabric_b.local_addr().unwrap());

    let fabric_a = Fabric::new(node_a, test_config(), membership.clone());
    fabric_a
        .transact_register(ECHO_TYPE, echo_template(), 64, silent_responder())
        .unwrap();
    fabric_a.start().await.unwrap();
    membership.add_node(node_a, fabric_a.local_addr().unwrap());

    let mut first = fabric_a.msg_pool().acquire(ECHO_TYPE).unwrap();
    first.set_u32(1, 1).unwrap();
    let mut second = fabric_a.msg_pool().acquire(ECHO_TYPE).unwrap();
    second.set_u32(1, 2).unwrap();

    let (r1, r2) = tokio::join!(
        fabric_a.transact_call(node_b, first, Duration::from_secs(5)),
        fabric_a.transact_call(node_b, second, Duration::from_secs(5)),
    );
    let r1 = r1.unwrap();
    let r2 = r2.unwrap();
    assert_eq!(r1.get_u32(1), Some(1001), "reply must match its own request");
    assert_eq!(r2.get_u32(1), Some(1002), "reply must match its own request");
    drop(r1);
    drop(r2);

    assert_eq!(fabric_a.pending_transactions(), 0);

    fabric_a.stop();
    fabric_b.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transact_to_unreachable_node_times_out_once() {
    let membership = Arc::new(StaticMembership::new());
    let node_a = NodeId(1);
    let node_b = NodeId(2);
    // known member, but nothing listens there
    membership.add_node(node_b, "127.0.0.1:1".parse().unwrap());

    let fabric_a = Fabric::new(node_a, test_config(), membership.clone());
    fabric_a
        .transact_register(ECHO_TYPE, echo_template(), 64, silent_responder())
        .unwrap();
    fabric_a.start().await.unwrap();
    membership.add_node(node_a, fabric_a.local_addr().unwrap());

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    let outcome: Arc<Mutex<Option<FabricError>>> = Arc::new(Mutex::new(None));
    let outcome_cb = outcome.clone();

    let mut msg = fabric_a.msg_pool().acquire(ECHO_TYPE).unwrap();
    msg.set_u32(1, 9).unwrap();
    let started_at = Instant::now();
    fabric_a.transact_start(
        node_b,
        msg,
        Duration::from_millis(200),
        Box::new(move |result| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
            *outcome_cb.lock().unwrap() = result.err();
        }),
    );

    let deadline = Instant::now() + Duration::from_secs(5);
    while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = started_at.elapsed();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(
        elapsed >= Duration::from_millis(180),
        "completed early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1500),
        "completed late: {elapsed:?}"
    );
    assert!(matches!(
        outcome.lock().unwrap().as_ref(),
        Some(FabricError::Timeout { timeout_ms: 200, .. })
    ));

    // a late reaper pass or stray reply must not fire the callback again
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(fabric_a.pending_transactions(), 0);

    fabric_a.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transact_to_unknown_node_completes_through_callback() {
    let membership = Arc::new(StaticMembership::new());
    let fabric = Fabric::new(NodeId(1), test_config(), membership.clone());
    fabric
        .transact_register(ECHO_TYPE, echo_template(), 64, silent_responder())
        .unwrap();
    fabric.start().await.unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    let msg = fabric.msg_pool().acquire(ECHO_TYPE).unwrap();
    // never fails synchronously: the addressing error arrives via the
    // completion callback
    fabric.transact_start(
        NodeId(99),
        msg,
        Duration::from_secs(5),
        Box::new(move |result| {
            tx.send(result.err()).unwrap();
        }),
    );
    let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(err, Some(FabricError::NoSuchNode { .. })));
    assert_eq!(fabric.pending_transactions(), 0);

    fabric.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_responder_request_still_times_out() {
    let membership = Arc::new(StaticMembership::new());
    let node_a = NodeId(1);
    let node_b = NodeId(2);

    let fabric_b = Fabric::new(node_b, test_config(), membership.clone());
    fabric_b
        .transact_register(ECHO_TYPE, echo_template(), 64, silent_responder())
        .unwrap();
    fabric_b.start().await.unwrap();
    membership.add_node(node_b, fabric_b.local_addr().unwrap());

    let fabric_a = Fabric::new(node_a, test_config(), membership.clone());
    fabric_a
        .transact_register(ECHO_TYPE, echo_template(), 64, silent_responder())
        .unwrap();
    fabric_a.start().await.unwrap();
    membership.add_node(node_a, fabric_a.local_addr().unwrap());

    let mut msg = fabric_a.msg_pool().acquire(ECHO_TYPE).unwrap();
    msg.set_u32(1, 5).unwrap();
    let err = fabric_a
        .transact_call(node_b, msg, Duration::from_millis(250))
        .await
        .unwrap_err();
    assert!(matches!(err, FabricError::Timeout { .. }));
    assert_eq!(fabric_a.pending_transactions(), 0);

    fabric_a.stop();
    fabric_b.stop();
}
