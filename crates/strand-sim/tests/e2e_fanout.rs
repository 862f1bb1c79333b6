use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use strand_adapter::{LocalSocket, RequestError};
use strand_core::{BroadcastOptions, Packet};
use strand_sim::{wait_until, SimCluster, SimConfig};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_sockets_gathers_every_process() {
    let sim = SimCluster::start(SimConfig::default().with_nodes(3)).await;
    assert!(sim.wait_for_convergence(Duration::from_secs(2)).await);
    for (i, node) in sim.nodes.iter().enumerate() {
        node.local.connect(LocalSocket::new(format!("s{i}")).in_rooms(["all"]));
    }
    sim.node(2).local.connect(LocalSocket::new("outsider"));

    let sockets = sim
        .node(0)
        .adapter
        .fetch_sockets(&BroadcastOptions::default().to("all"))
        .await
        .expect("every peer should answer");
    let mut ids: Vec<String> = sockets.into_iter().map(|s| s.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["s0", "s1", "s2"]);
    sim.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_side_emit_with_ack_keeps_partial_results_on_timeout() {
    let sim = SimCluster::start(
        SimConfig::default()
            .with_nodes(4)
            .with_requests_timeout(Duration::from_millis(200)),
    )
    .await;
    assert!(sim.wait_for_convergence(Duration::from_secs(2)).await);
    sim.node(1).local.set_server_side_reply(Some(json!("one")));
    sim.node(2).local.set_server_side_reply(Some(json!("two")));

    let err = sim
        .node(0)
        .adapter
        .server_side_emit_with_ack(vec![json!("ping")])
        .await
        .expect_err("silent peer should cause a timeout");
    assert_eq!(
        err.to_string(),
        "timeout reached: only 2 responses received out of 3"
    );
    let RequestError::Timeout { mut partial, .. } = err else {
        panic!("expected a timeout");
    };
    partial.sort_by_key(|v| v.to_string());
    assert_eq!(partial, vec![json!("one"), json!("two")]);

    assert!(
        wait_until(Duration::from_secs(1), || {
            sim.node(3).local.server_side_events() == vec![vec![json!("ping")]]
        })
        .await
    );
    sim.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_side_emit_with_ack_resolves_when_all_reply() {
    let sim = SimCluster::start(SimConfig::default().with_nodes(3)).await;
    assert!(sim.wait_for_convergence(Duration::from_secs(2)).await);
    for node in &sim.nodes[1..] {
        node.local.set_server_side_reply(Some(json!("pong")));
    }

    let replies = sim
        .node(0)
        .adapter
        .server_side_emit_with_ack(vec![json!("ping")])
        .await
        .expect("every peer should reply");
    assert_eq!(replies, vec![json!("pong"), json!("pong")]);
    sim.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_with_ack_collects_remote_counts_and_acks() {
    let sim = SimCluster::start(SimConfig::default().with_nodes(3)).await;
    assert!(sim.wait_for_convergence(Duration::from_secs(2)).await);
    for (i, node) in sim.nodes.iter().enumerate() {
        node.local
            .connect(LocalSocket::new(format!("s{i}")).with_ack_reply(json!(i)));
    }

    let clients = Arc::new(AtomicUsize::new(0));
    let acks = Arc::new(Mutex::new(Vec::<Value>::new()));
    let clients_cb = Arc::clone(&clients);
    let acks_cb = Arc::clone(&acks);
    sim.node(0)
        .adapter
        .broadcast_with_ack(
            Packet::event("/", "question", vec![]),
            &BroadcastOptions::default().with_timeout(Duration::from_secs(1)),
            Arc::new(move |n| {
                clients_cb.fetch_add(n, Ordering::SeqCst);
            }),
            Arc::new(move |v| acks_cb.lock().expect("lock").push(v)),
        )
        .await
        .expect("broadcast should publish");

    assert!(
        wait_until(Duration::from_secs(2), || {
            clients.load(Ordering::SeqCst) == 3 && acks.lock().expect("lock").len() == 3
        })
        .await
    );
    sim.shutdown().await;
}
