use std::time::Duration;

use roster_core::wire::TIMEOUT_NOTICE;
use roster_services::ServerError;

use crate::{test_server, wait_for_sessions, Peer};

#[tokio::test]
async fn concurrent_clients_all_register() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let mut peers = Vec::new();
    for i in 0..8 {
        peers.push(Peer::join(addr, &format!("node-{i}")).await.unwrap());
    }
    wait_for_sessions(&server, 8).await.unwrap();

    let mut names: Vec<String> = server
        .registry()
        .list()
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    names.sort();
    let expected: Vec<String> = (0..8).map(|i| format!("node-{i}")).collect();
    assert_eq!(names, expected);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_client_times_out_without_blocking_others() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let mut silent = Peer::connect(addr).await.unwrap();
    // A second client arriving while the first is silent still registers.
    let _named = Peer::join(addr, "prompt").await.unwrap();
    wait_for_sessions(&server, 1).await.unwrap();

    let notice = silent.next_command().await.unwrap();
    assert_eq!(notice.as_deref(), Some(TIMEOUT_NOTICE));

    let names: Vec<String> = server.registry().list().await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["prompt".to_string()]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_keeps_the_first_listener() {
    let server = test_server();
    let addr = server.start().await.unwrap();
    assert!(matches!(server.start().await, Err(ServerError::AlreadyRunning)));

    // Still accepting on the first address.
    let _peer = Peer::join(addr, "after-second-start").await.unwrap();
    wait_for_sessions(&server, 1).await.unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_notifies_peers_and_empties_registry() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let a = Peer::join(addr, "a").await.unwrap().spawn_echo();
    let b = Peer::join(addr, "b").await.unwrap().spawn_echo();
    wait_for_sessions(&server, 2).await.unwrap();

    server.stop().await.unwrap();

    assert_eq!(a.await.unwrap().unwrap(), "stop");
    assert_eq!(b.await.unwrap().unwrap(), "stop");
    assert!(server.registry().is_empty().await);
    assert!(!server.is_running());

    let status = server.status().await;
    assert!(!status.loop_running && !status.loop_alive);
}

#[tokio::test]
async fn stopped_server_refuses_new_connections() {
    let server = test_server();
    let addr = server.start().await.unwrap();
    server.stop().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(Peer::connect(addr).await.is_err());
}
