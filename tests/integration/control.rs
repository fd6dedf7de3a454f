use roster_services::PingState;

use crate::{test_server, wait_for_sessions, Peer};

#[tokio::test]
async fn ping_measures_round_trip_against_echoing_peer() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let agent = Peer::join(addr, "echo").await.unwrap().spawn_echo();
    wait_for_sessions(&server, 1).await.unwrap();

    let session = server.registry().find_by_name("echo").await.unwrap();
    let rtt = session.ping().await.unwrap();

    assert!(rtt.round_trip_ms >= 0.0);
    assert!((rtt.round_trip_ms - (rtt.send_ms + rtt.recv_ms)).abs() < 1e-9);
    assert!(matches!(session.ping_state(), PingState::Complete(_)));

    server.stop().await.unwrap();
    assert_eq!(agent.await.unwrap().unwrap(), "stop");
}

#[tokio::test]
async fn ping_against_silent_peer_fails_without_killing_it() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let _mute = Peer::join(addr, "mute").await.unwrap();
    wait_for_sessions(&server, 1).await.unwrap();

    let session = server.registry().find_by_name("mute").await.unwrap();
    assert!(session.ping().await.is_err());
    assert!(matches!(session.ping_state(), PingState::Failed(_)));
    assert_eq!(server.registry().len().await, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn kick_is_idempotent() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let agent = Peer::join(addr, "target").await.unwrap().spawn_echo();
    wait_for_sessions(&server, 1).await.unwrap();

    let session = server.registry().find_by_name("target").await.unwrap();
    assert!(server.registry().kick_session(&session).await);
    assert!(!server.registry().kick_session(&session).await);
    assert!(session.is_closed());
    assert!(server.registry().is_empty().await);

    assert_eq!(agent.await.unwrap().unwrap(), "kick");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn kick_by_address_leaves_other_peers() {
    let server = test_server();
    let addr = server.start().await.unwrap();

    let first = Peer::join(addr, "first").await.unwrap().spawn_echo();
    wait_for_sessions(&server, 1).await.unwrap();
    let _second = Peer::join(addr, "second").await.unwrap();
    wait_for_sessions(&server, 2).await.unwrap();

    // Both peers share 127.0.0.1; the earliest connection goes first.
    assert!(server.registry().kick("127.0.0.1".parse().unwrap()).await);
    assert_eq!(first.await.unwrap().unwrap(), "kick");

    let names: Vec<String> = server.registry().list().await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["second".to_string()]);

    server.stop().await.unwrap();
}
