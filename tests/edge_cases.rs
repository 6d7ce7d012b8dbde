#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests: boundary sizes, misbehaving peers, teardown paths and
//! registry limits.

mod common;

use std::time::Duration;

use common::{next_matching, TestServer};
use peer_protocol::core::frame::{Frame, HEADER_LEN};
use peer_protocol::core::serialization::SerializationConfig;
use peer_protocol::error::ProtocolError;
use peer_protocol::protocol::dispatcher::DataIds;
use peer_protocol::protocol::handshake::client_handshake;
use peer_protocol::protocol::ids;
use peer_protocol::protocol::request::ResponseProviders;
use peer_protocol::protocol::reroute::{RerouteRule, RerouteTable};
use peer_protocol::{ConnectionEvent, DisconnectReason, ServerEvent};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn registry(local_id: u8) -> DataIds {
    DataIds::new(
        local_id,
        SerializationConfig::default(),
        RerouteTable::shared(),
        ResponseProviders::shared(),
    )
}

/// Open a socket and complete the handshake by hand, returning the raw stream
async fn raw_peer(server: &mut TestServer, name: &str) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(&server.config.client.address).await.unwrap();
    let (local, _remote) = client_handshake(&mut stream, name, 1024 * 1024, Duration::from_secs(2))
        .await
        .unwrap();
    let id = local.client_id();
    next_matching(&mut server.events, |e| {
        matches!(e, ServerEvent::Connected(peer) if peer.client_id() == id)
    })
    .await;
    (stream, id)
}

// ============================================================================
// SIZE LIMITS
// ============================================================================

#[tokio::test]
async fn test_payload_at_limit_is_accepted() {
    let mut server = TestServer::start_tuned(|c| c.transport.max_payload_size = 4096).await;
    let (client, _events) = server.connect("alice").await;

    client.send_string(&"a".repeat(4096)).unwrap();
    assert!(matches!(
        client.send_string(&"a".repeat(4097)),
        Err(ProtocolError::OversizedPacket(4097))
    ));

    let event = server
        .peer_event(client.client_id(), |e| {
            matches!(e, ConnectionEvent::StringReceived { .. })
        })
        .await;
    match event {
        ServerEvent::Connection {
            event: ConnectionEvent::StringReceived { value, .. },
            ..
        } => assert_eq!(value.len(), 4096),
        other => panic!("Unexpected event: {other:?}"),
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_inbound_frame_interrupts() {
    let mut server = TestServer::start_tuned(|c| c.transport.max_payload_size = 2048).await;
    let (mut stream, id) = raw_peer(&mut server, "mallory").await;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&(1u64 << 40).to_le_bytes());
    header.extend_from_slice(&[ids::STRING, id]);
    stream.write_all(&header).await.unwrap();

    let event = server.peer_event(id, ConnectionEvent::is_disconnect).await;
    assert!(matches!(
        event,
        ServerEvent::Connection {
            event: ConnectionEvent::Disconnected {
                reason: DisconnectReason::Interrupted,
                ..
            },
            ..
        }
    ));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_string_payload() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;

    client.send_string("").unwrap();
    let event = server
        .peer_event(1, |e| matches!(e, ConnectionEvent::StringReceived { .. }))
        .await;
    assert_eq!(
        event,
        ServerEvent::Connection {
            client_id: 1,
            event: ConnectionEvent::StringReceived {
                value: String::new(),
                sender_id: 1
            }
        }
    );
    server.stop().await.unwrap();
}

// ============================================================================
// MISBEHAVING PEERS
// ============================================================================

#[tokio::test]
async fn test_abrupt_close_is_interrupted() {
    let mut server = TestServer::start().await;
    let (stream, id) = raw_peer(&mut server, "mallory").await;
    drop(stream);

    let event = server.peer_event(id, ConnectionEvent::is_disconnect).await;
    assert_eq!(
        event,
        ServerEvent::Connection {
            client_id: id,
            event: ConnectionEvent::Disconnected {
                client_id: id,
                reason: DisconnectReason::Interrupted
            }
        }
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_close_mid_frame_is_interrupted() {
    let mut server = TestServer::start().await;
    let (mut stream, id) = raw_peer(&mut server, "mallory").await;

    let bytes = Frame::new(ids::STRING, id, b"truncated".to_vec()).to_bytes();
    stream.write_all(&bytes[..HEADER_LEN + 3]).await.unwrap();
    stream.shutdown().await.unwrap();

    let event = server.peer_event(id, ConnectionEvent::is_disconnect).await;
    assert!(matches!(
        event,
        ServerEvent::Connection {
            event: ConnectionEvent::Disconnected {
                reason: DisconnectReason::Interrupted,
                ..
            },
            ..
        }
    ));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_garbage_payloads_do_not_close_connection() {
    let mut server = TestServer::start().await;
    let (mut stream, id) = raw_peer(&mut server, "mallory").await;

    // int64 with the wrong width, an empty request and an unknown ID
    for frame in [
        Frame::new(ids::INT64, id, vec![1, 2, 3]),
        Frame::new(ids::REQUEST, id, Vec::new()),
        Frame::new(ids::SERVER_STOP, id, vec![0]),
    ] {
        stream.write_all(&frame.to_bytes()).await.unwrap();
    }
    for expected in [ids::INT64, ids::REQUEST, ids::SERVER_STOP] {
        let event = server
            .peer_event(id, |e| matches!(e, ConnectionEvent::UndefinedPacket { .. }))
            .await;
        assert!(matches!(
            event,
            ServerEvent::Connection {
                event: ConnectionEvent::UndefinedPacket { packet_id, .. },
                ..
            } if packet_id == expected
        ));
    }

    let connection = server.handle.connection(id).expect("still connected");
    assert!(connection.is_active());
    assert_eq!(connection.metrics().undefined_packets, 3);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_silent_handshake_releases_id() {
    let mut server = TestServer::start_tuned(|c| {
        c.server.handshake_timeout = Duration::from_millis(200);
    })
    .await;

    let silent = TcpStream::connect(&server.config.client.address).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (client, _events) = server.connect("alice").await;
    assert_eq!(client.client_id(), 1);
    drop(silent);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_peer() {
    let mut server = TestServer::start_tuned(|c| c.server.max_connections = 1).await;
    let (_first, _events) = server.connect("alice").await;

    let mut config = server.config.clone();
    config.client.connection_timeout = Duration::from_millis(500);
    let second = peer_protocol::transport::client::connect_with_defaults(&config).await;
    assert!(second.is_err());
    assert_eq!(server.handle.connection_count(), 1);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_setup_hook_turns_peer_away() {
    let mut server = TestServer::start_with(|_, registry| {
        registry.register_custom_packet::<String, _>(ids::REQUEST, |_, _| {})
    })
    .await;

    let (_client, mut events) =
        peer_protocol::transport::client::connect_with_defaults(&server.config)
            .await
            .unwrap();
    let event = next_matching(&mut events, ConnectionEvent::is_disconnect).await;
    assert!(matches!(
        event,
        ConnectionEvent::Disconnected {
            reason: DisconnectReason::Interrupted,
            ..
        }
    ));
    assert_eq!(server.handle.connection_count(), 0);
    common::assert_silent(&mut server.events, Duration::from_millis(100), |e| {
        matches!(e, ServerEvent::Connected(_))
    })
    .await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = peer_protocol::config::NetworkConfig::default_with_overrides(|c| {
        c.client.address = address;
        c.client.connection_timeout = Duration::from_millis(500);
    });
    assert!(peer_protocol::transport::client::connect_with_defaults(&config)
        .await
        .is_err());
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[tokio::test]
async fn test_disconnect_reason_is_first_one() {
    let mut server = TestServer::start().await;
    let (client, mut events) = server.connect("alice").await;

    assert!(client.kick("self-kick"));
    assert!(!client.dispose());
    assert!(!client.disconnect(DisconnectReason::Interrupted, "late"));

    let event = next_matching(&mut events, ConnectionEvent::is_disconnect).await;
    assert!(matches!(
        event,
        ConnectionEvent::Disconnected {
            reason: DisconnectReason::Kicked,
            ..
        }
    ));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_requests_after_close_fail_fast() {
    let mut server = TestServer::start().await;
    let (client, mut events) = server.connect("alice").await;
    client.registry().declare_response::<i64>(1).unwrap();

    client.dispose();
    next_matching(&mut events, ConnectionEvent::is_disconnect).await;

    assert!(matches!(
        client.request::<i64>(1).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(client.pending_requests(), 0);
    server.stop().await.unwrap();
}

// ============================================================================
// REGISTRY LIMITS
// ============================================================================

#[test]
fn test_custom_range_boundaries() {
    let ids_table = registry(0);
    assert!(ids_table
        .register_custom_packet::<String, _>(ids::FIRST_CUSTOM, |_, _| {})
        .is_ok());
    assert!(ids_table
        .register_custom_packet::<String, _>(ids::LAST_CUSTOM, |_, _| {})
        .is_ok());
    assert!(matches!(
        ids_table.register_custom_packet::<String, _>(ids::LAST_CUSTOM + 1, |_, _| {}),
        Err(ProtocolError::PacketIdReserved(241))
    ));
}

#[test]
fn test_reroute_rule_validation() {
    let table = RerouteTable::new();
    assert!(matches!(
        table.add_rule(RerouteRule::new(3, 3, 20)),
        Err(ProtocolError::InvalidReroute(_))
    ));
    assert!(matches!(
        table.add_rule(RerouteRule::new(1, 2, ids::DISCONNECT)),
        Err(ProtocolError::InvalidReroute(_))
    ));
    table.add_rule(RerouteRule::new(1, 2, 20)).unwrap();
    assert!(matches!(
        table.add_rule(RerouteRule::new(1, 3, 20)),
        Err(ProtocolError::DuplicateReroute {
            packet_id: 20,
            from_client: 1
        })
    ));
    assert_eq!(table.remove_rule(20, 1).unwrap(), Some(RerouteRule::new(1, 2, 20)));
    assert!(table.is_empty());
}

#[test]
fn test_provider_ids_are_unique() {
    let providers = ResponseProviders::new();
    providers.register(5, || 1u8).unwrap();
    assert!(matches!(
        providers.register(5, || 2u8),
        Err(ProtocolError::ProviderIdInUse(5))
    ));
    assert!(providers.unregister(5).unwrap());
    assert!(!providers.unregister(5).unwrap());
    assert!(matches!(
        providers.handle_request(5, &SerializationConfig::default()),
        Err(ProtocolError::NotImplemented(5))
    ));
}

#[test]
fn test_response_for_unknown_request_resolves() {
    let ids_table = registry(0);
    let resolution = ids_table.resolve(&Frame::new(ids::RESPONSE, 0, vec![200]));
    assert!(resolution.is_ok());
    assert!(matches!(
        ids_table.resolve(&Frame::new(ids::RESPONSE, 0, Vec::new())),
        Err(ProtocolError::MalformedPayload(_))
    ));
}
