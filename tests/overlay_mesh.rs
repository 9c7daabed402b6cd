//! End-to-end overlay tests on a loopback network.
//!
//! These boot real nodes with fast timers, let discovery and the overlay
//! handshake settle, and verify the routing semantics the application
//! sees. Each test uses its own probe-port range so parallel tests cannot
//! hear each other's beacons.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;

use weft::{
    Application, Header, Message, Node, OverlayConfig, OverlayId, SendError, StaticSecret,
};

/// Delivery callback collecting everything it sees.
struct Collector {
    delivered: Mutex<Vec<Message>>,
}

impl Collector {
    fn new() -> Arc<Collector> {
        Arc::new(Collector {
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn messages(&self) -> Vec<Message> {
        self.delivered.lock().clone()
    }
}

impl Application for Collector {
    fn deliver(&self, msg: Message) {
        self.delivered.lock().push(msg);
    }
}

fn test_config(probe_base: u16, probe_count: u16) -> OverlayConfig {
    OverlayConfig {
        probe_ports: (probe_base..probe_base + probe_count).collect(),
        beacon_interval: Duration::from_millis(200),
        exchange_period: Duration::from_secs(1),
        ..OverlayConfig::default()
    }
}

fn overlay_key() -> StaticSecret {
    StaticSecret::from([0x42u8; 32])
}

fn app_message(data: Vec<u8>) -> Message {
    Message {
        head: Header {
            meta: vec![0x99, 0x98, 0x97, 0x96],
            key: vec![0x00, 0x01],
            iv: vec![0x02, 0x03],
            extra: None,
        },
        data,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_nodes_route_all_pairs() {
    let overlay = OverlayId::from("mesh-all-pairs");
    let config = test_config(34100, 8);

    let mut apps = Vec::new();
    let mut nodes = Vec::new();
    for _ in 0..4 {
        let app = Collector::new();
        let node = Node::with_config(overlay.clone(), overlay_key(), app.clone(), config.clone());
        node.boot().await.expect("boot");
        apps.push(app);
        nodes.push(node);
    }

    // Let discovery and the handshakes settle.
    sleep(Duration::from_secs(3)).await;

    for (i, src) in nodes.iter().enumerate() {
        for dst in &nodes {
            let data = format!("{}:{}->{}", i, src.node_id(), dst.node_id()).into_bytes();
            src.send(dst.node_id(), app_message(data)).expect("send accepted");
            // Spacing keeps per-pair ordering observable.
            sleep(Duration::from_millis(100)).await;
        }
    }
    sleep(Duration::from_secs(2)).await;

    for (j, (app, node)) in apps.iter().zip(&nodes).enumerate() {
        let got = app.messages();
        assert_eq!(got.len(), 4, "node {} delivered {} messages", j, got.len());

        let mut datas: Vec<Vec<u8>> = got.iter().map(|m| m.data.clone()).collect();
        datas.sort();
        datas.dedup();
        assert_eq!(datas.len(), 4, "node {} saw a duplicate delivery", j);

        let own_id = node.node_id().to_string();
        for msg in &got {
            // Header fields arrive byte-identical.
            assert_eq!(msg.head.meta, vec![0x99, 0x98, 0x97, 0x96]);
            assert_eq!(msg.head.key, vec![0x00, 0x01]);
            assert_eq!(msg.head.iv, vec![0x02, 0x03]);
            assert_eq!(msg.head.extra, None);
            // And each was truly addressed to this node.
            assert!(
                String::from_utf8_lossy(&msg.data).ends_with(&own_id),
                "node {} received a message for someone else",
                j
            );
        }
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_send_delivers_locally() {
    let overlay = OverlayId::from("mesh-self-send");
    let app = Collector::new();
    let node = Node::with_config(
        overlay,
        overlay_key(),
        app.clone(),
        test_config(34200, 4),
    );
    node.boot().await.expect("boot");

    let msg = app_message(b"to myself".to_vec());
    node.send(node.node_id(), msg.clone()).expect("send accepted");

    sleep(Duration::from_millis(500)).await;
    let got = app.messages();
    assert_eq!(got.len(), 1, "exactly one local delivery");
    assert_eq!(got[0], msg);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_idempotent_and_stops_sends() {
    let overlay = OverlayId::from("mesh-shutdown");
    let app = Collector::new();
    let node = Node::with_config(
        overlay,
        overlay_key(),
        app.clone(),
        test_config(34300, 4),
    );
    node.boot().await.expect("boot");
    assert!(!node.listen_addrs().is_empty());

    node.shutdown().await;
    node.shutdown().await;

    let err = node
        .send(node.node_id(), app_message(b"late".to_vec()))
        .expect_err("send after shutdown");
    assert!(matches!(err, SendError::Shutdown | SendError::Saturated));
    assert!(app.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn boot_twice_is_an_error() {
    let overlay = OverlayId::from("mesh-reboot");
    let node = Node::with_config(
        overlay,
        overlay_key(),
        Collector::new(),
        test_config(34400, 4),
    );
    node.boot().await.expect("first boot");
    assert!(node.boot().await.is_err(), "second boot must fail");
    node.shutdown().await;
}
