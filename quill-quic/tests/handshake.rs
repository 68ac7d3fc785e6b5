//! End-to-end tests: a client connection and a router-fronted server
//! exchanging packets in memory.

mod common;

use std::time::Duration;

use bytes::Bytes;

use common::Network;
use quill_quic::{
    ConnectionEvent, ConnectionState, Direction, EngineConfig, RouteOutcome, StreamEvent,
    StreamId, TransportError,
};

fn no_retry() -> EngineConfig {
    EngineConfig {
        require_retry: false,
        ..EngineConfig::default()
    }
}

fn drain_events(conn: &quill_quic::Connection) -> Vec<ConnectionEvent> {
    std::iter::from_fn(|| conn.poll_event()).collect()
}

#[tokio::test]
async fn test_retry_costs_one_round_trip_before_handshake() {
    let mut net = Network::new(EngineConfig::default());
    net.client.connect().await.unwrap();

    // first Initial carries no token
    let outcomes = net.client_to_server();
    assert_eq!(outcomes.len(), 1);
    let RouteOutcome::Retry(retry) = &outcomes[0] else {
        panic!("expected Retry, got {:?}", outcomes[0]);
    };
    let retry_scid = retry.header.scid.clone();
    assert_eq!(&retry.original_dcid, net.client.original_dcid());
    assert!(net.router.is_empty());

    // second Initial echoes the token and opens the connection
    assert_eq!(net.server_to_client(), 1);
    let outcomes = net.client_to_server();
    assert_eq!(outcomes.len(), 1);
    let RouteOutcome::Delivered { connection, created } = &outcomes[0] else {
        panic!("expected delivery, got {:?}", outcomes[0]);
    };
    assert!(*created);
    assert_eq!(connection.local_cid(), &retry_scid);
    assert_eq!(net.client_datagrams, 2);
    assert_eq!(connection.state(), ConnectionState::BeforeDone);

    net.pump();
    let server = net.server();
    assert_eq!(net.client.state(), ConnectionState::Ready);
    assert_eq!(server.state(), ConnectionState::Done);
    assert_eq!(net.router.len(), 1);
}

#[tokio::test]
async fn test_handshake_without_retry() {
    let mut net = Network::new(no_retry());
    net.client.connect().await.unwrap();
    net.pump();

    let server = net.server();
    assert!(net.client.is_established());
    assert!(server.is_established());
    assert_eq!(server.local_cid(), net.client.original_dcid());
    assert_eq!(&server.remote_cid(), net.client.local_cid());
    assert_eq!(
        drain_events(&net.client),
        vec![ConnectionEvent::HandshakeComplete]
    );
    assert_eq!(drain_events(&server), vec![ConnectionEvent::HandshakeComplete]);
    // handshake packets were all acknowledged or discarded with their keys
    assert_eq!(server.unacked(), 0);
}

#[tokio::test]
async fn test_request_and_response_on_bidirectional_stream() {
    let mut net = Network::new(no_retry());
    net.client.connect().await.unwrap();
    net.pump();
    let server = net.server();
    drain_events(&server);

    let id = net.client.open_stream(Direction::Bidirectional).unwrap();
    assert_eq!(id, StreamId(0));
    let _ = net
        .client
        .write(id, Bytes::from_static(b"GET /"), true)
        .unwrap();
    net.pump();

    let events = drain_events(&server);
    assert!(events.contains(&ConnectionEvent::Stream(StreamEvent::Opened { stream_id: id })));
    assert_eq!(server.read(id).unwrap(), Some(Bytes::from_static(b"GET /")));

    let _ = server.write(id, Bytes::from_static(b"200"), true).unwrap();
    net.pump();
    assert_eq!(net.client.read(id).unwrap(), Some(Bytes::from_static(b"200")));
    assert!(!net.client.streams().can_receive(id));
    assert_eq!(net.client.unacked(), 0);
    assert_eq!(server.unacked(), 0);
}

#[tokio::test]
async fn test_stream_seven_reassembles_in_two_reads() {
    let mut net = Network::new(no_retry());
    net.client.connect().await.unwrap();
    net.pump();
    let server = net.server();

    assert_eq!(server.open_stream(Direction::Unidirectional).unwrap(), StreamId(3));
    let id = server.open_stream(Direction::Unidirectional).unwrap();
    assert_eq!(id, StreamId(7));

    let _ = server.write(id, Bytes::from_static(b"abc"), false).unwrap();
    net.pump();
    assert_eq!(net.client.read(id).unwrap(), Some(Bytes::from_static(b"abc")));
    assert!(net.client.streams().can_receive(id));

    let _ = server.write(id, Bytes::from_static(b"def"), true).unwrap();
    net.pump();
    assert_eq!(net.client.read(id).unwrap(), Some(Bytes::from_static(b"def")));
    assert!(!net.client.streams().can_receive(id));
}

#[tokio::test]
async fn test_unsupported_version_is_refused() {
    let client_config = EngineConfig {
        supported_versions: vec![0xff00_001d],
        ..no_retry()
    };
    let mut net = Network::with_configs(client_config, no_retry());
    net.client.connect().await.unwrap();

    let outcomes = net.client_to_server();
    let RouteOutcome::VersionNegotiation(vn) = &outcomes[0] else {
        panic!("expected version negotiation, got {:?}", outcomes[0]);
    };
    assert_eq!(&vn.dcid, net.client.local_cid());
    assert_eq!(vn.supported_versions, vec![quill_quic::VERSION_1]);
    assert!(net.router.is_empty());

    net.server_to_client();
    assert!(net.client.is_closed());
    assert_eq!(
        drain_events(&net.client),
        vec![ConnectionEvent::Closed {
            error_code: TransportError::ConnectionRefused.code(),
            reason: "no common version".into(),
            by_peer: true,
        }]
    );
    // nothing goes back to the server
    assert_eq!(net.client_wire.len(), 0);
}

#[tokio::test]
async fn test_application_close_through_router() {
    let mut net = Network::new(no_retry());
    net.client.connect().await.unwrap();
    net.pump();
    let server = net.server();

    net.client.close(0x10, "going away");
    net.pump();
    assert!(server.is_closed());
    assert!(drain_events(&server).contains(&ConnectionEvent::Closed {
        error_code: 0x10,
        reason: "going away".into(),
        by_peer: true,
    }));
    assert_eq!(net.router.purge_closed(), 1);
    assert!(net.router.is_empty());
}

#[tokio::test]
async fn test_unknown_connection_packets_are_dropped() {
    let mut net = Network::new(no_retry());
    net.client.connect().await.unwrap();
    net.pump();
    let server = net.server();
    net.router.remove(server.local_cid());

    let id = net.client.open_stream(Direction::Bidirectional).unwrap();
    let _ = net.client.write(id, Bytes::from_static(b"lost"), false).unwrap();
    let outcomes = net.client_to_server();
    assert!(!outcomes.is_empty());
    assert!(outcomes.iter().all(|o| matches!(o, RouteOutcome::Dropped)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_close_on_both_sides() {
    let mut net = Network::new(no_retry());
    net.client.connect().await.unwrap();
    net.pump();
    let server = net.server();
    drain_events(&net.client);
    drain_events(&server);

    tokio::time::sleep(Duration::from_millis(30_001)).await;
    tokio::task::yield_now().await;

    assert!(net.client.is_closed());
    assert!(server.is_closed());
    // idle close is silent
    assert_eq!(net.client_wire.len(), 0);
    assert_eq!(net.server_wire.len(), 0);
    assert!(matches!(
        drain_events(&server).as_slice(),
        [ConnectionEvent::Closed { error_code: 0, by_peer: false, .. }]
    ));
    assert_eq!(net.router.purge_closed(), 1);
}
