//! End-to-end scenarios over real sockets: one server, one or more clients.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{assert_silent, next_matching, TestServer};
use peer_protocol::core::serialization::SerializationConfig;
use peer_protocol::error::{ProtocolError, Result};
use peer_protocol::protocol::property::{Bindable, PropertyInfo};
use peer_protocol::protocol::reroute::RerouteRule;
use peer_protocol::transport::ConnectionState;
use peer_protocol::{ConnectionEvent, DisconnectReason, ServerEvent};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Move {
    x: i32,
    y: i32,
}

#[derive(Default)]
struct Lobby {
    motd: String,
    secret: String,
}

impl Bindable for Lobby {
    fn describe(&self, name: &str) -> Option<PropertyInfo> {
        match name {
            "motd" => Some(PropertyInfo::public::<String>()),
            "secret" => Some(PropertyInfo::private::<String>()),
            _ => None,
        }
    }

    fn set_by_name(&mut self, name: &str, payload: &[u8], config: &SerializationConfig) -> Result<()> {
        match name {
            "motd" => self.motd = config.deserialize(payload)?,
            "secret" => self.secret = config.deserialize(payload)?,
            _ => return Err(ProtocolError::PropertyNotFound(name.to_string())),
        }
        Ok(())
    }

    fn get_by_name(&self, name: &str, config: &SerializationConfig) -> Result<Vec<u8>> {
        match name {
            "motd" => config.serialize(&self.motd),
            "secret" => config.serialize(&self.secret),
            _ => Err(ProtocolError::PropertyNotFound(name.to_string())),
        }
    }
}

#[tokio::test]
async fn test_client_ping_reaches_server() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;
    assert_eq!(client.client_id(), 1);
    assert!(client.remote().is_server);

    client.send_string("ping").unwrap();
    let event = server
        .peer_event(1, |e| matches!(e, ConnectionEvent::StringReceived { .. }))
        .await;
    assert_eq!(
        event,
        ServerEvent::Connection {
            client_id: 1,
            event: ConnectionEvent::StringReceived {
                value: "ping".to_string(),
                sender_id: 1
            }
        }
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_push_reaches_client() {
    let mut server = TestServer::start().await;
    let (client, mut events) = server.connect("alice").await;

    let peer = server.handle.connection(client.client_id()).expect("peer");
    peer.send_int64(-7).unwrap();

    let event = next_matching(&mut events, |e| matches!(e, ConnectionEvent::Int64Received { .. })).await;
    assert_eq!(
        event,
        ConnectionEvent::Int64Received {
            value: -7,
            sender_id: 0
        }
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_is_answered_by_provider() {
    let mut server = TestServer::start().await;
    server.handle.providers().register(9, || 42i64).unwrap();
    let (client, _events) = server.connect("alice").await;

    client.registry().declare_response::<i64>(9).unwrap();
    let value: i64 = client
        .request_timeout(9, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(client.pending_requests(), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_undeclared_request_fails_before_sending() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;

    let result = client.request::<i64>(9).await;
    assert!(matches!(result, Err(ProtocolError::RequestNotDeclared(9))));
    assert_eq!(client.metrics().frames_sent, 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_without_provider_is_reported() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;
    client.registry().declare_response::<String>(77).unwrap();

    let result = client
        .request_timeout::<String>(77, Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));

    let event = server
        .peer_event(1, |e| matches!(e, ConnectionEvent::RequestUnhandled { .. }))
        .await;
    assert_eq!(
        event,
        ServerEvent::Connection {
            client_id: 1,
            event: ConnectionEvent::RequestUnhandled {
                request_id: 77,
                sender_id: 1
            }
        }
    );
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_timed_out_request_does_not_shift_later_responses() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;
    client.registry().declare_response::<i64>(9).unwrap();

    let result = client
        .request_timeout::<i64>(9, Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
    assert_eq!(client.pending_requests(), 0);
    server
        .peer_event(1, |e| matches!(e, ConnectionEvent::RequestUnhandled { .. }))
        .await;

    server.handle.providers().register(9, || 42i64).unwrap();
    for _ in 0..2 {
        let value: i64 = client
            .request_timeout(9, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
    assert_eq!(client.pending_requests(), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_property_sync_updates_bound_instance() {
    let lobby = Arc::new(Mutex::new(Lobby::default()));
    let bound = Arc::clone(&lobby);
    let mut server = TestServer::start_with(move |_, ids| {
        ids.bind_property(bound.clone(), "motd", 5)
    })
    .await;
    let (client, _events) = server.connect("alice").await;

    client.publish(5, &"X".to_string()).unwrap();
    let event = server
        .peer_event(1, |e| matches!(e, ConnectionEvent::PropertySynchronized { .. }))
        .await;
    assert_eq!(
        event,
        ServerEvent::Connection {
            client_id: 1,
            event: ConnectionEvent::PropertySynchronized {
                property: "motd".to_string(),
                packet_id: 5
            }
        }
    );
    assert_eq!(lobby.lock().unwrap().motd, "X");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_private_property_cannot_be_bound() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;

    let lobby = Arc::new(Mutex::new(Lobby::default()));
    let result = client.registry().bind_property(lobby, "secret", 6);
    assert!(matches!(result, Err(ProtocolError::PropertyNotPublic(_))));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_bound_sends_current_value() {
    let remote = Arc::new(Mutex::new(Lobby::default()));
    let bound = Arc::clone(&remote);
    let mut server = TestServer::start_with(move |_, ids| {
        ids.bind_property(bound.clone(), "motd", 5)
    })
    .await;
    let (client, _events) = server.connect("alice").await;

    let local = Arc::new(Mutex::new(Lobby {
        motd: "welcome".to_string(),
        secret: String::new(),
    }));
    client.registry().bind_property(local, "motd", 5).unwrap();
    client.publish_bound(5).unwrap();
    assert!(matches!(
        client.publish_bound(6),
        Err(ProtocolError::PropertyNotBound(6))
    ));

    server
        .peer_event(1, |e| matches!(e, ConnectionEvent::PropertySynchronized { .. }))
        .await;
    assert_eq!(remote.lock().unwrap().motd, "welcome");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reroute_delivers_to_destination_only() {
    let mut server = TestServer::start().await;
    let (alice, mut alice_events) = server.connect("alice").await;
    let (bob, mut bob_events) = server.connect("bob").await;
    let (a, b) = (alice.client_id(), bob.client_id());

    server
        .handle
        .reroutes()
        .add_rule(RerouteRule::new(a, b, 20))
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    bob.registry()
        .register_custom_packet::<Move, _>(20, move |value, sender| {
            sink.lock().unwrap().push((value, sender));
        })
        .unwrap();
    alice.registry().declare_custom_packet::<Move>(20).unwrap();

    alice.send_custom(20, &Move { x: 3, y: 4 }).unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, ConnectionEvent::CustomPacket { .. })).await;
    let encoded = alice
        .registry()
        .serialization()
        .serialize(&Move { x: 3, y: 4 })
        .unwrap();
    assert_eq!(
        event,
        ConnectionEvent::CustomPacket {
            packet_id: 20,
            sender_id: a,
            type_tag: "Move".to_string(),
            payload: encoded.into()
        }
    );
    assert_eq!(*received.lock().unwrap(), vec![(Move { x: 3, y: 4 }, a)]);

    server
        .peer_event(a, |e| matches!(e, ConnectionEvent::Rerouted { .. }))
        .await;
    assert_silent(&mut alice_events, Duration::from_millis(200), |e| {
        matches!(e, ConnectionEvent::CustomPacket { .. })
    })
    .await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_declared_packet_value_is_readable_from_event() {
    let mut server = TestServer::start_with(|_, ids| ids.declare_custom_packet::<Move>(21)).await;
    let (client, _events) = server.connect("alice").await;
    client.registry().declare_custom_packet::<Move>(21).unwrap();

    client.send_custom(21, &Move { x: -2, y: 9 }).unwrap();
    let event = server
        .peer_event(1, |e| matches!(e, ConnectionEvent::CustomPacket { .. }))
        .await;
    let ServerEvent::Connection {
        event: ConnectionEvent::CustomPacket { payload, type_tag, .. },
        ..
    } = event
    else {
        panic!("Unexpected event: {event:?}");
    };
    assert_eq!(type_tag, "Move");
    let value: Move = SerializationConfig::default().deserialize(&payload).unwrap();
    assert_eq!(value, Move { x: -2, y: 9 });
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_custom_send_fails() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;

    let result = client.send_custom(30, &Move { x: 0, y: 0 });
    assert!(matches!(result, Err(ProtocolError::UndefinedPacket(30))));

    client.registry().declare_custom_packet::<String>(30).unwrap();
    let result = client.send_custom(30, &Move { x: 0, y: 0 });
    assert!(matches!(result, Err(ProtocolError::PacketTypeMismatch { .. })));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_packet_is_surfaced_raw() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;

    client.send_raw(99, vec![1, 2, 3]).unwrap();
    let event = server
        .peer_event(1, |e| matches!(e, ConnectionEvent::UndefinedPacket { .. }))
        .await;
    match event {
        ServerEvent::Connection {
            event: ConnectionEvent::UndefinedPacket { packet_id, payload, .. },
            ..
        } => {
            assert_eq!(packet_id, 99);
            assert_eq!(payload.as_ref(), &[1, 2, 3]);
        }
        other => panic!("Expected UndefinedPacket, got {other:?}"),
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_dispose_is_graceful_on_both_ends() {
    let mut server = TestServer::start().await;
    let (client, mut events) = server.connect("alice").await;
    let id = client.client_id();

    assert!(client.dispose());
    assert!(!client.dispose());

    let event = next_matching(&mut events, ConnectionEvent::is_disconnect).await;
    assert_eq!(
        event,
        ConnectionEvent::Disconnected {
            client_id: 0,
            reason: DisconnectReason::Graceful
        }
    );
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.send_string("late"),
        Err(ProtocolError::ConnectionClosed)
    ));

    let event = server.peer_event(id, ConnectionEvent::is_disconnect).await;
    assert_eq!(
        event,
        ServerEvent::Connection {
            client_id: id,
            event: ConnectionEvent::Disconnected {
                client_id: id,
                reason: DisconnectReason::Graceful
            }
        }
    );
    assert_eq!(server.handle.connection_count(), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_kick_is_reported_on_both_ends() {
    let mut server = TestServer::start().await;
    let (client, mut events) = server.connect("alice").await;
    let id = client.client_id();

    server.handle.kick(id, "spamming").unwrap();

    let event = next_matching(&mut events, ConnectionEvent::is_disconnect).await;
    assert_eq!(
        event,
        ConnectionEvent::Disconnected {
            client_id: 0,
            reason: DisconnectReason::Kicked
        }
    );
    let event = server.peer_event(id, ConnectionEvent::is_disconnect).await;
    assert!(matches!(
        event,
        ServerEvent::Connection {
            event: ConnectionEvent::Disconnected {
                reason: DisconnectReason::Kicked,
                ..
            },
            ..
        }
    ));
    assert!(server.handle.kick(id, "again").is_err());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_pending_request_fails_when_connection_closes() {
    let mut server = TestServer::start().await;
    let (client, _events) = server.connect("alice").await;
    client.registry().declare_response::<i64>(3).unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.request::<i64>(3).await })
    };
    server
        .peer_event(1, |e| matches!(e, ConnectionEvent::RequestUnhandled { .. }))
        .await;
    client.dispose();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("request should end")
        .unwrap();
    assert!(matches!(result, Err(ProtocolError::RequestCancelled(3))));
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_ids_are_reused_after_disconnect() {
    let mut server = TestServer::start().await;
    let (first, mut first_events) = server.connect("alice").await;
    let (second, _second_events) = server.connect("bob").await;
    assert_eq!((first.client_id(), second.client_id()), (1, 2));

    first.dispose();
    next_matching(&mut first_events, ConnectionEvent::is_disconnect).await;
    server.peer_event(1, ConnectionEvent::is_disconnect).await;

    let (third, _third_events) = server.connect("carol").await;
    assert_eq!(third.client_id(), 1);
    let names: Vec<String> = server.handle.peers().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["carol".to_string(), "bob".to_string()]);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let mut server = TestServer::start().await;
    let (_alice, mut alice_events) = server.connect("alice").await;
    let (_bob, mut bob_events) = server.connect("bob").await;

    server.stop().await.unwrap();

    for events in [&mut alice_events, &mut bob_events] {
        let event = next_matching(events, ConnectionEvent::is_disconnect).await;
        assert_eq!(
            event,
            ConnectionEvent::Disconnected {
                client_id: 0,
                reason: DisconnectReason::Graceful
            }
        );
    }
}
