use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusty_hub::{Connection, Envelope, Hub, HubConfig, HubState};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn eventually<F: Fn() -> bool>(check: F) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn recv(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("queue closed")
}

async fn assert_silent(rx: &mut mpsc::Receiver<Vec<u8>>) {
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "expected no payload"
    );
}

fn start(config: HubConfig) -> (Hub, CancellationToken, tokio::task::JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let (hub, handle) = Hub::spawn(config, cancel.clone());
    (hub, cancel, handle)
}

#[tokio::test]
async fn test_broadcast_reaches_every_client_once_in_order() {
    let (hub, cancel, _handle) = start(HubConfig::default());

    let mut receivers = Vec::new();
    for _ in 0..5 {
        let (conn, rx) = Connection::new(None, 16);
        hub.register(conn).unwrap();
        receivers.push(rx);
    }
    eventually(|| hub.client_count() == 5).await;

    for i in 0..10 {
        hub.broadcast(format!("msg-{}", i).into_bytes());
    }

    for rx in receivers.iter_mut() {
        for i in 0..10 {
            assert_eq!(recv(rx).await, format!("msg-{}", i).into_bytes());
        }
        assert_silent(rx).await;
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_room_broadcast_excludes_sender() {
    let (hub, cancel, _handle) = start(HubConfig::default());
    let (a, mut a_rx) = Connection::new(Some("a".to_string()), 8);
    let (b, mut b_rx) = Connection::new(Some("b".to_string()), 8);
    let (c, mut c_rx) = Connection::new(Some("c".to_string()), 8);
    for conn in [&a, &b, &c] {
        hub.register(conn.clone()).unwrap();
    }
    eventually(|| hub.client_count() == 3).await;

    hub.join_room(&a, "general").unwrap();
    hub.join_room(&b, "general").unwrap();

    hub.broadcast_to_room("general", b"hello".to_vec(), Some(a.as_ref()));

    assert_eq!(recv(&mut b_rx).await, b"hello".to_vec());
    assert_silent(&mut a_rx).await;
    // not a member of the room
    assert_silent(&mut c_rx).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_broadcast_to_missing_room_is_noop() {
    let (hub, cancel, _handle) = start(HubConfig::default());
    let (a, mut a_rx) = Connection::new(None, 8);
    hub.register(a.clone()).unwrap();
    eventually(|| hub.client_count() == 1).await;

    hub.join_room(&a, "temp").unwrap();
    hub.leave_room(&a, "temp").unwrap();
    hub.broadcast_to_room("temp", b"late".to_vec(), None);
    hub.broadcast(b"after".to_vec());

    // the global broadcast still flows, the room one vanished
    assert_eq!(recv(&mut a_rx).await, b"after".to_vec());
    assert_eq!(hub.client_count(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_slow_consumer_is_disconnected() {
    let (hub, cancel, _handle) = start(HubConfig::default().with_send_buffer(1));
    let (fast, mut fast_rx) = Connection::new(Some("fast".to_string()), hub.config().send_buffer);
    let (slow, _slow_rx) = Connection::new(Some("slow".to_string()), hub.config().send_buffer);
    hub.register(fast.clone()).unwrap();
    hub.register(slow.clone()).unwrap();
    hub.join_room(&slow, "general").unwrap();
    eventually(|| hub.client_count() == 2).await;

    hub.broadcast(b"first".to_vec());
    assert_eq!(recv(&mut fast_rx).await, b"first".to_vec());
    hub.broadcast(b"second".to_vec());
    assert_eq!(recv(&mut fast_rx).await, b"second".to_vec());

    eventually(|| hub.client_count() == 1).await;
    assert!(hub.connection(fast.id()).is_some());
    assert!(hub.connection(slow.id()).is_none());
    assert!(slow.is_closed());
    assert!(!hub.room_exists("general"));
    assert_eq!(hub.stats().slow_consumers_disconnected, 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_concurrent_register_then_unregister_all() {
    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let (c, d) = (connected.clone(), disconnected.clone());
    let config = HubConfig::default()
        .on_connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .on_disconnect(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
    let (hub, cancel, _handle) = start(config);

    let tasks: Vec<_> = (0..100)
        .map(|i| {
            let hub = hub.clone();
            tokio::spawn(async move {
                let (conn, rx) = Connection::new(None, 4);
                hub.register(conn.clone()).unwrap();
                hub.join_room(&conn, &format!("room-{}", i % 7)).unwrap();
                (conn, rx)
            })
        })
        .collect();
    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.unwrap());
    }
    eventually(|| hub.client_count() == 100).await;
    assert_eq!(hub.room_count(), 7);

    for (conn, _) in &conns {
        let hub = hub.clone();
        let conn = conn.clone();
        tokio::spawn(async move { hub.unregister(&conn) });
    }

    eventually(|| hub.client_count() == 0 && hub.room_count() == 0).await;
    eventually(|| disconnected.load(Ordering::SeqCst) == 100).await;
    assert_eq!(connected.load(Ordering::SeqCst), 100);
    cancel.cancel();
}

#[tokio::test]
async fn test_cancellation_closes_everything() {
    let (hub, cancel, handle) = start(HubConfig::default());
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (conn, rx) = Connection::new(None, 4);
        hub.register(conn.clone()).unwrap();
        hub.join_room(&conn, "general").unwrap();
        receivers.push((conn, rx));
    }
    eventually(|| hub.client_count() == 3).await;

    cancel.cancel();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("dispatcher did not stop")
        .unwrap();

    assert_eq!(hub.state(), HubState::Stopped);
    assert_eq!(hub.client_count(), 0);
    assert_eq!(hub.room_count(), 0);
    for (conn, rx) in receivers.iter_mut() {
        assert!(conn.is_closed());
        assert!(conn.rooms().is_empty());
        assert!(rx.recv().await.is_none());
    }

    // producers are never blocked, even after shutdown
    hub.broadcast(b"ignored".to_vec());
    assert_eq!(hub.stats().dropped_broadcasts, 1);
}

#[tokio::test]
async fn test_envelope_broadcast_encodes_json() {
    let (hub, cancel, _handle) = start(HubConfig::default());
    let (a, mut a_rx) = Connection::new(None, 4);
    hub.register(a.clone()).unwrap();
    hub.join_room(&a, "news").unwrap();
    eventually(|| hub.client_count() == 1).await;

    let envelope = Envelope::new("headline", json!({"title": "hub ships"})).with_room("news");
    hub.broadcast_envelope_to_room("news", &envelope, None).unwrap();

    let received = Envelope::from_slice(&recv(&mut a_rx).await).unwrap();
    assert_eq!(received.kind, "headline");
    assert_eq!(received.room.as_deref(), Some("news"));
    assert_eq!(received.data["title"], "hub ships");
    cancel.cancel();
}

#[tokio::test]
async fn test_stats_snapshot() {
    let (hub, cancel, _handle) = start(HubConfig::default());
    let (a, _rx) = Connection::new(None, 4);
    hub.register(a.clone()).unwrap();
    hub.join_room(&a, "general").unwrap();
    eventually(|| hub.client_count() == 1).await;

    let stats = hub.stats();
    assert_eq!(stats.state, HubState::Running);
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.rooms, 1);

    let value = serde_json::to_value(&stats).unwrap();
    assert_eq!(value["state"], "running");
    cancel.cancel();
}
