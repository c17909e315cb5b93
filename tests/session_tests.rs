//! End-to-end session behavior: data delivery per channel, server-triggered
//!  disconnect, RTT probing, and reliable delivery across a lossy network.

use quadlink::auth::{EchoResponder, NoAuthenticator};
use quadlink::connection_state::ConnectionState;
use quadlink::server_info::NoServerInfo;
use quadlink::socket::DatagramSocket;
use quadlink::test_util::fake_network::FakeNetwork;
use quadlink::test_util::{wait_for, RecordingClientEvents, RecordingServerEvents};
use quadlink::{Channel, Client, ConnectCode, QuadlinkConfig, Server};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct Session {
    server: Arc<Server>,
    server_events: Arc<RecordingServerEvents>,
    client: Arc<Client>,
    client_events: Arc<RecordingClientEvents>,
}

async fn connect_over_loopback() -> Session {
    let server_events = Arc::new(RecordingServerEvents::new());
    let server = Arc::new(Server::new(
        Arc::new(QuadlinkConfig::new(5)),
        Arc::new(NoAuthenticator),
        Arc::new(NoServerInfo),
        server_events.clone(),
    ));
    server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

    let client_events = Arc::new(RecordingClientEvents::new());
    let result = Client::connect(
        Arc::new(QuadlinkConfig::new(5)),
        server.local_addr().unwrap(),
        Arc::new(EchoResponder),
        client_events.clone(),
        CONNECT_TIMEOUT,
    )
    .await
    .unwrap();
    assert_eq!(result.code, ConnectCode::Success);

    Session {
        server,
        server_events,
        client: result.client.unwrap(),
        client_events,
    }
}

#[tokio::test]
async fn test_server_triggered_disconnect() {
    let session = connect_over_loopback().await;

    let peer = session.server.client_connection(0).unwrap();
    session.server.disconnect_client(0).await.unwrap();

    assert_eq!(peer.state().await, ConnectionState::Disconnected);
    assert!(session.server.client_connection(0).is_none());
    assert_eq!(
        *session.server_events.terminated.lock(),
        vec![(0, "disconnected by server".to_string())]
    );

    // the client must observe the termination within a second
    let client_events = session.client_events.clone();
    assert!(wait_for(Duration::from_secs(1), || !client_events.disconnected.lock().is_empty()).await);

    session.server.stop().await;
}

#[tokio::test]
async fn test_reliable_ordered_payloads_arrive_in_order() {
    let session = connect_over_loopback().await;

    let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i, 0xaa, 0xbb]).collect();
    for payload in &payloads {
        session
            .client
            .send_to_server(payload, Channel::RELIABLE | Channel::ORDERED)
            .await
            .unwrap();
    }

    let server_events = session.server_events.clone();
    assert!(wait_for(Duration::from_secs(2), || server_events.data.lock().len() >= 5).await);

    let received: Vec<Vec<u8>> = session
        .server_events
        .data
        .lock()
        .iter()
        .map(|(_, _, data)| data.clone())
        .collect();
    assert_eq!(received, payloads);

    session.client.disconnect().await;
    session.server.stop().await;
}

#[tokio::test]
async fn test_data_flows_server_to_client() {
    let session = connect_over_loopback().await;

    session
        .server
        .send_to_client(0, b"state update", Channel::RELIABLE | Channel::ORDERED)
        .await
        .unwrap();

    let client_events = session.client_events.clone();
    assert!(wait_for(Duration::from_secs(2), || !client_events.data.lock().is_empty()).await);
    assert_eq!(session.client_events.data.lock()[0].1, b"state update".to_vec());

    session.client.disconnect().await;
    session.server.stop().await;
}

#[tokio::test]
async fn test_ping_converges_to_a_positive_average() {
    let session = connect_over_loopback().await;

    let client = session.client.clone();
    assert!(wait_for(Duration::from_secs(2), || client.ping() > Duration::ZERO).await);

    session.client.disconnect().await;
    session.server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reliable_delivery_under_loss() {
    let network = FakeNetwork::new(0.4, Duration::from_millis(20));

    let server_events = Arc::new(RecordingServerEvents::new());
    let server = Arc::new(Server::new(
        Arc::new(QuadlinkConfig::new(5)),
        Arc::new(NoAuthenticator),
        Arc::new(NoServerInfo),
        server_events.clone(),
    ));
    let server_socket = network.endpoint();
    let server_addr = server_socket.local_addr().unwrap();
    server.start_with_socket(server_socket).await.unwrap();

    // the handshake crosses the same lossy network - the retransmit duty
    // carries it through
    let result = Client::connect_with_socket(
        Arc::new(QuadlinkConfig::new(5)),
        server_addr,
        Arc::new(EchoResponder),
        Arc::new(RecordingClientEvents::new()),
        Duration::from_secs(15),
        network.endpoint(),
    )
    .await
    .unwrap();
    assert_eq!(result.code, ConnectCode::Success);
    let client = result.client.unwrap();

    let payloads: Vec<Vec<u8>> = (0..50u32).map(|i| i.to_le_bytes().to_vec()).collect();
    for payload in &payloads {
        client.send_to_server(payload, Channel::RELIABLE).await.unwrap();
    }

    let expected: HashSet<Vec<u8>> = payloads.into_iter().collect();
    let events = server_events.clone();
    let all_arrived = wait_for(Duration::from_secs(30), || {
        let received: HashSet<Vec<u8>> =
            events.data.lock().iter().map(|(_, _, data)| data.clone()).collect();
        received.len() >= 50
    })
    .await;
    assert!(all_arrived, "not all reliable payloads arrived within the deadline");

    let received: HashSet<Vec<u8>> = server_events
        .data
        .lock()
        .iter()
        .map(|(_, _, data)| data.clone())
        .collect();
    assert_eq!(received, expected);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_client_termination_removes_the_peer() {
    let session = connect_over_loopback().await;

    session.client.disconnect().await;

    let server = session.server.clone();
    assert!(wait_for(Duration::from_secs(1), || server.client_connection(0).is_none()).await);
    assert!(wait_for(Duration::from_secs(1), || {
        !session.server_events.terminated.lock().is_empty()
    })
    .await);

    session.server.stop().await;
}
