//! Shared helpers for end-to-end tests: a server on an ephemeral port and
//! bounded waits on event streams.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fmt::Debug;
use std::time::Duration;

use peer_protocol::config::NetworkConfig;
use peer_protocol::error::Result;
use peer_protocol::protocol::dispatcher::DataIds;
use peer_protocol::protocol::peer::PeerInfo;
use peer_protocol::transport::client::connect_with_defaults;
use peer_protocol::transport::server::{ServerEvent, ServerEventStream, ServerHandle, TcpServer};
use peer_protocol::transport::{EventStream, TcpConnection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub handle: ServerHandle,
    pub events: ServerEventStream,
    pub config: NetworkConfig,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_, _| Ok(())).await
    }

    pub async fn start_with<F>(setup: F) -> Self
    where
        F: Fn(&PeerInfo, &DataIds) -> Result<()> + Send + Sync + 'static,
    {
        Self::launch(|_| {}, setup).await
    }

    pub async fn start_tuned<C>(tune: C) -> Self
    where
        C: FnOnce(&mut NetworkConfig),
    {
        Self::launch(tune, |_, _| Ok(())).await
    }

    async fn launch<C, F>(tune: C, setup: F) -> Self
    where
        C: FnOnce(&mut NetworkConfig),
        F: Fn(&PeerInfo, &DataIds) -> Result<()> + Send + Sync + 'static,
    {
        let mut config = NetworkConfig::default_with_overrides(|c| {
            c.server.address = "127.0.0.1:0".to_string();
            c.server.shutdown_timeout = Duration::from_secs(2);
            tune(c);
        });
        let mut server = TcpServer::bind(&config).await.expect("bind");
        config.client.address = server.local_addr().to_string();

        server = server.with_setup(setup);
        let handle = server.handle();
        let events = server.events().expect("events");
        let (shutdown, rx) = mpsc::channel(1);
        let task = tokio::spawn(server.run_with_shutdown(rx));

        Self {
            handle,
            events,
            config,
            shutdown,
            task,
        }
    }

    /// Connect a client and wait until the server has admitted it
    pub async fn connect(&mut self, name: &str) -> (TcpConnection, EventStream) {
        let mut config = self.config.clone();
        config.client.name = name.to_string();
        let (connection, events) = connect_with_defaults(&config).await.expect("connect");

        let id = connection.client_id();
        next_matching(&mut self.events, |event| {
            matches!(event, ServerEvent::Connected(peer) if peer.client_id() == id)
        })
        .await;
        (connection, events)
    }

    /// Next event the server saw from `client_id` that satisfies `pred`
    pub async fn peer_event<F>(&mut self, client_id: u8, mut pred: F) -> ServerEvent
    where
        F: FnMut(&peer_protocol::ConnectionEvent) -> bool,
    {
        next_matching(&mut self.events, |event| match event {
            ServerEvent::Connection { client_id: id, event } => *id == client_id && pred(event),
            ServerEvent::Connected(_) => false,
        })
        .await
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(()).await;
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
    }
}

/// Wait for the first item satisfying `pred`, skipping the rest
pub async fn next_matching<S, E, F>(stream: &mut S, mut pred: F) -> E
where
    S: Stream<Item = E> + Unpin,
    E: Debug,
    F: FnMut(&E) -> bool,
{
    tokio::time::timeout(WAIT, async {
        while let Some(event) = stream.next().await {
            if pred(&event) {
                return event;
            }
        }
        panic!("event stream ended");
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert that nothing satisfying `pred` arrives within `window`
pub async fn assert_silent<S, E, F>(stream: &mut S, window: Duration, mut pred: F)
where
    S: Stream<Item = E> + Unpin,
    E: Debug,
    F: FnMut(&E) -> bool,
{
    let _ = tokio::time::timeout(window, async {
        while let Some(event) = stream.next().await {
            if pred(&event) {
                panic!("unexpected event: {event:?}");
            }
        }
    })
    .await;
}
