//! Full socket-based integration tests driving client and listener over real
//! loopback UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rudp_client::ClientConnection;
use rudp_core::{AcceptAll, ConnectionEvent, NullStatistics, Reliability, TransportConfig};
use rudp_listener::{Listener, ListenerHandle};

async fn spawn_listener(config: TransportConfig) -> (SocketAddr, tokio::sync::mpsc::Receiver<rudp_listener::Accepted>) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (listener, accepted, _listener_handle) =
        Listener::bind(addr, config, Arc::new(NullStatistics), Arc::new(AcceptAll))
            .await
            .unwrap();
    let local = listener.local_addr().unwrap();
    tokio::spawn(listener.run());
    (local, accepted)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_establishes_connection_on_both_sides() {
    let (server_addr, mut accepted) = spawn_listener(TransportConfig::default()).await;

    let mut client = ClientConnection::connect(
        server_addr,
        b"client hello payload".to_vec(),
        TransportConfig::default(),
        Arc::new(NullStatistics),
    )
    .await
    .unwrap();

    let server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .expect("server should accept within timeout")
        .expect("accept channel should stay open");

    client.wait_connected().await.expect("client handshake should succeed");
    assert_eq!(server_side.handle.remote_addr().ip(), client.handle.remote_addr().ip());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reliable_payload_round_trips_and_is_delivered_once() {
    let (server_addr, mut accepted) = spawn_listener(TransportConfig::default()).await;

    let mut client = ClientConnection::connect(
        server_addr,
        b"hi".to_vec(),
        TransportConfig::default(),
        Arc::new(NullStatistics),
    )
    .await
    .unwrap();

    let mut server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    client.wait_connected().await.unwrap();

    client
        .handle
        .send(Reliability::Reliable, b"payload-A".to_vec())
        .await
        .unwrap();

    let mut deliveries = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), server_side.events.recv()).await {
            if let ConnectionEvent::DataReceived(payload) = event {
                assert_eq!(payload, b"payload-A");
                deliveries += 1;
            }
        }
        if deliveries > 0 {
            break;
        }
    }
    assert_eq!(deliveries, 1, "expected exactly one delivery of the reliable payload");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ack_callback_fires_on_delivery() {
    let (server_addr, mut accepted) = spawn_listener(TransportConfig::default()).await;

    let mut client = ClientConnection::connect(
        server_addr,
        b"hi".to_vec(),
        TransportConfig::default(),
        Arc::new(NullStatistics),
    )
    .await
    .unwrap();

    let server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    client.wait_connected().await.unwrap();
    drop(server_side); // listener still acks; app need not read events for acks to flow

    let ack_rx = client
        .handle
        .send_reliable_tracked(b"needs-ack".to_vec())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), ack_rx)
        .await
        .expect("ack should arrive before timeout")
        .expect("ack sender should not be dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_disconnect_is_observed_by_the_peer() {
    let (server_addr, mut accepted) = spawn_listener(TransportConfig::default()).await;

    let mut client = ClientConnection::connect(
        server_addr,
        b"hi".to_vec(),
        TransportConfig::default(),
        Arc::new(NullStatistics),
    )
    .await
    .unwrap();
    let mut server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    client.wait_connected().await.unwrap();

    client.handle.disconnect(b"bye".to_vec()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), server_side.events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ConnectionEvent::Disconnected(reason) => assert_eq!(reason, "bye"),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listener_stop_disconnects_live_peers() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (listener, mut accepted, listener_handle): (_, _, ListenerHandle) =
        Listener::bind(addr, TransportConfig::default(), Arc::new(NullStatistics), Arc::new(AcceptAll))
            .await
            .unwrap();
    let server_addr = listener.local_addr().unwrap();
    let run_handle = tokio::spawn(listener.run());

    let mut client = ClientConnection::connect(
        server_addr,
        b"hi".to_vec(),
        TransportConfig::default(),
        Arc::new(NullStatistics),
    )
    .await
    .unwrap();
    let server_side = tokio::time::timeout(Duration::from_secs(2), accepted.recv())
        .await
        .unwrap()
        .unwrap();
    client.wait_connected().await.unwrap();
    drop(server_side);

    listener_handle.stop().await;
    run_handle.await.unwrap().unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), client.events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ConnectionEvent::Disconnected(reason) => assert_eq!(reason, "listener shutdown"),
        other => panic!("expected Disconnected, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_to_nothing_eventually_fails() {
    let mut config = TransportConfig::default();
    config.resend_timeout_initial = Duration::from_millis(5);
    config.resend_timeout_max = Duration::from_millis(20);
    config.resend_retry_limit = 3;

    // Nothing is listening on this ephemeral port.
    let dead_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let mut client = ClientConnection::connect(dead_addr, b"hi".to_vec(), config, Arc::new(NullStatistics))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), client.wait_connected())
        .await
        .expect("handshake should resolve (as a failure) within timeout");
    assert!(result.is_err(), "handshake to an unreachable peer should fail");
}
