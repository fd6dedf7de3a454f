use std::time::Duration;

use crate::{test_server, wait_for_sessions, Peer};

#[tokio::test]
async fn refresh_prunes_exactly_the_hung_up_peers() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let _alive = Peer::join(addr, "alive").await.unwrap();
    let gone = Peer::join(addr, "gone").await.unwrap();
    wait_for_sessions(&server, 2).await.unwrap();

    drop(gone);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let removed = server.registry().refresh().await;
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name(), "gone");

    let names: Vec<String> = server.registry().list().await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["alive".to_string()]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn broadcast_reaches_live_peers_and_drops_dead_ones() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let mut live = Peer::join(addr, "live").await.unwrap();
    let dead = Peer::join(addr, "dead").await.unwrap();
    wait_for_sessions(&server, 2).await.unwrap();

    drop(dead);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = server.registry().broadcast("maintenance at noon").await;
    assert_eq!(report.delivered, 1);
    assert_eq!(server.registry().len().await, 1);
    assert_eq!(
        live.next_command().await.unwrap().as_deref(),
        Some("maintenance at noon")
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn lookups_miss_cleanly() {
    let server = test_server();
    server.start().await.unwrap();

    let registry = server.registry();
    assert!(registry.find_by_name("nobody").await.is_none());
    assert!(registry
        .find_by_address("10.255.255.1".parse().unwrap())
        .await
        .is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn lookup_finds_by_name_and_address() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let peer = Peer::join(addr, "workstation").await.unwrap();
    wait_for_sessions(&server, 1).await.unwrap();

    let by_name = server.registry().find_by_name("workstation").await.unwrap();
    assert_eq!(by_name.addr(), peer.local);

    let by_ip = server.registry().find_by_address(peer.local.ip()).await.unwrap();
    assert_eq!(by_ip.name(), "workstation");

    server.stop().await.unwrap();
}
