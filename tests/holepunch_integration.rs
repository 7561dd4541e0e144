//! Three-party hole punching on loopback: B reaches C through mediator A.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use p2beer::{HolePunchError, Node, NodeConfig, PeerId, StreamNode};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn start_node() -> Node {
    Node::start(NodeConfig {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ..NodeConfig::default()
    })
    .await
    .expect("start failed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn punch_through_mediator_opens_both_ends() {
    let mediator = start_node().await;
    let b = start_node().await;
    let c = start_node().await;

    let mediator_endpoint = mediator.listener_endpoint().unwrap();
    b.connect(&mediator_endpoint).await.expect("b to mediator");
    c.connect(&mediator_endpoint).await.expect("c to mediator");
    assert!(!b.is_connected(&c.peer_id()));

    let stream = timeout(TEST_TIMEOUT, b.connect_via(c.peer_id(), &[mediator.peer_id()]))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");
    assert_eq!(stream.remote_peer_id().unwrap(), c.peer_id());
    assert!(stream.opened());

    wait_until(|| b.is_connected(&c.peer_id()) && c.is_connected(&b.peer_id())).await;
}

#[tokio::test]
async fn second_punch_reports_existing_connection() {
    let mediator = start_node().await;
    let b = start_node().await;
    let c = start_node().await;

    let mediator_endpoint = mediator.listener_endpoint().unwrap();
    b.connect(&mediator_endpoint).await.expect("b to mediator");
    c.connect(&mediator_endpoint).await.expect("c to mediator");

    timeout(TEST_TIMEOUT, b.connect_via(c.peer_id(), &[mediator.peer_id()]))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");

    let again = b.connect_via(c.peer_id(), &[mediator.peer_id()]).await;
    assert_eq!(again.err().unwrap(), HolePunchError::AlreadyConnected(c.peer_id()));
}

#[tokio::test]
async fn mediator_without_target_fails() {
    let mediator = start_node().await;
    let b = start_node().await;
    b.connect(&mediator.listener_endpoint().unwrap())
        .await
        .expect("b to mediator");

    let stranger = PeerId::random();
    let result = timeout(TEST_TIMEOUT, b.connect_via(stranger, &[mediator.peer_id()]))
        .await
        .expect("hole punch timed out");
    assert_eq!(result.err().unwrap(), HolePunchError::ConnectionFailed { peer: stranger });
}

#[tokio::test]
async fn punch_reaches_a_target_that_stopped_listening() {
    let mediator = start_node().await;
    let b = start_node().await;
    let c = start_node().await;

    let mediator_endpoint = mediator.listener_endpoint().unwrap();
    b.connect(&mediator_endpoint).await.expect("b to mediator");
    c.connect(&mediator_endpoint).await.expect("c to mediator");

    let c_listener = c.listener_endpoint().unwrap().to_socket_addr().unwrap();
    c.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = timeout(TEST_TIMEOUT, b.connect_via(c.peer_id(), &[mediator.peer_id()]))
        .await
        .expect("hole punch timed out")
        .expect("hole punch failed");
    assert_eq!(stream.remote_peer_id().unwrap(), c.peer_id());
    assert!(stream.opened());

    let remote = stream.remote_endpoint().unwrap().to_socket_addr().unwrap();
    assert_ne!(remote.port(), c_listener.port(), "must come through the punched port");

    wait_until(|| b.is_connected(&c.peer_id()) && c.is_connected(&b.peer_id())).await;
}
