//! # Server Hub
//!
//! Accepts TCP clients, assigns each a client ID (1..=254) during the handshake
//! and keeps one [`TcpConnection`] per peer. The server owns the reroute table
//! and the response providers every connection shares, and forwards rerouted
//! frames between its peers.
//!
//! ```rust,no_run
//! use peer_protocol::config::NetworkConfig;
//! use peer_protocol::transport::server::TcpServer;
//!
//! # async fn run() -> peer_protocol::error::Result<()> {
//! let server = TcpServer::bind(&NetworkConfig::default()).await?;
//! server.handle().providers().register(9, || 42i64)?;
//! server.run().await
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{NetworkConfig, ServerConfig};
use crate::core::frame::Frame;
use crate::core::serialization::SerializationConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::disconnect::DisconnectReason;
use crate::protocol::dispatcher::DataIds;
use crate::protocol::event::ConnectionEvent;
use crate::protocol::handshake::server_handshake;
use crate::protocol::peer::{PeerInfo, UNASSIGNED_ID};
use crate::protocol::request::SharedResponseProviders;
use crate::protocol::reroute::SharedRerouteTable;
use crate::transport::connection::{ConnectionContext, EventStream, FrameForwarder, TcpConnection};
use crate::utils::timeout::with_timeout_error;

/// Events of every peer, tagged with the peer's client ID
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected(PeerInfo),
    Connection { client_id: u8, event: ConnectionEvent },
}

pub type ServerEventStream = UnboundedReceiverStream<ServerEvent>;

#[derive(Default)]
struct PeerSlots {
    connections: HashMap<u8, TcpConnection>,
    reserved: HashSet<u8>,
}

/// Live connections by client ID
#[derive(Default)]
struct PeerTable {
    slots: RwLock<PeerSlots>,
}

impl PeerTable {
    /// Claim the lowest free client ID, or `None` when `limit` peers exist
    fn reserve(&self, limit: usize) -> Result<Option<u8>> {
        let mut slots = self
            .slots
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PEER_TABLE_LOCK.to_string()))?;
        if slots.connections.len() + slots.reserved.len() >= limit {
            return Ok(None);
        }
        let free = (1..UNASSIGNED_ID)
            .find(|id| !slots.connections.contains_key(id) && !slots.reserved.contains(id));
        if let Some(id) = free {
            slots.reserved.insert(id);
        }
        Ok(free)
    }

    fn release(&self, client_id: u8) {
        if let Ok(mut slots) = self.slots.write() {
            slots.reserved.remove(&client_id);
        }
    }

    fn insert(&self, client_id: u8, connection: TcpConnection) -> Result<()> {
        let mut slots = self
            .slots
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_PEER_TABLE_LOCK.to_string()))?;
        slots.reserved.remove(&client_id);
        slots.connections.insert(client_id, connection);
        Ok(())
    }

    fn remove(&self, client_id: u8) -> Option<TcpConnection> {
        self.slots
            .write()
            .ok()
            .and_then(|mut slots| slots.connections.remove(&client_id))
    }

    fn get(&self, client_id: u8) -> Option<TcpConnection> {
        self.slots
            .read()
            .ok()
            .and_then(|slots| slots.connections.get(&client_id).cloned())
    }

    fn all(&self) -> Vec<TcpConnection> {
        self.slots
            .read()
            .map(|slots| slots.connections.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl FrameForwarder for PeerTable {
    fn forward(&self, destination: u8, frame: Frame) -> Result<()> {
        let connection = self.get(destination).ok_or_else(|| {
            ProtocolError::Custom(format!("no peer with client id {destination}"))
        })?;
        connection.forward_frame(frame)
    }
}

/// Cloneable control surface of a running server
#[derive(Clone)]
pub struct ServerHandle {
    peers: Arc<PeerTable>,
    reroutes: SharedRerouteTable,
    providers: SharedResponseProviders,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn reroutes(&self) -> &SharedRerouteTable {
        &self.reroutes
    }

    pub fn providers(&self) -> &SharedResponseProviders {
        &self.providers
    }

    pub fn connection(&self, client_id: u8) -> Option<TcpConnection> {
        self.peers.get(client_id)
    }

    /// Info of every connected peer, ordered by client ID
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.all().iter().map(TcpConnection::remote).collect();
        peers.sort_by_key(PeerInfo::client_id);
        peers
    }

    pub fn connection_count(&self) -> usize {
        self.peers.all().len()
    }

    /// Disconnect a peer with reason `Kicked` on both ends
    pub fn kick(&self, client_id: u8, message: &str) -> Result<()> {
        let connection = self
            .peers
            .get(client_id)
            .ok_or(ProtocolError::ConnectionClosed)?;
        info!(client_id, message, "Kicking peer");
        connection.kick(message);
        Ok(())
    }

    /// Stop accepting and disconnect every peer
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct TcpServer {
    listener: TcpListener,
    config: ServerConfig,
    info: PeerInfo,
    context: ConnectionContext,
    handle: ServerHandle,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl TcpServer {
    #[instrument(skip(config), fields(address = %config.server.address))]
    pub async fn bind(config: &NetworkConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.server.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening");

        let context = ConnectionContext::from_config(&config.transport);
        let handle = ServerHandle {
            peers: Arc::new(PeerTable::default()),
            reroutes: Arc::clone(&context.reroutes),
            providers: Arc::clone(&context.providers),
            shutdown: CancellationToken::new(),
            local_addr,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener,
            config: config.server.clone(),
            info: PeerInfo::server(config.server.name.clone(), Some(local_addr)),
            context,
            handle,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// Run `setup` on each new peer's registry before its loops start
    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn(&PeerInfo, &DataIds) -> Result<()> + Send + Sync + 'static,
    {
        self.context = self.context.with_setup(setup);
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Serializers shared by every peer connection
    pub fn serialization(&self) -> &SerializationConfig {
        &self.context.serialization
    }

    /// Merged event stream of all peers. Available once.
    pub fn events(&mut self) -> Option<ServerEventStream> {
        self.events_rx.take().map(UnboundedReceiverStream::new)
    }

    /// Serve until CTRL+C or [`ServerHandle::shutdown`]
    pub async fn run(self) -> Result<()> {
        let shutdown = self.handle.shutdown.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received CTRL+C signal, shutting down");
                shutdown.cancel();
            }
        });
        self.serve().await
    }

    /// Serve until `shutdown_rx` yields or [`ServerHandle::shutdown`]
    pub async fn run_with_shutdown(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let shutdown = self.handle.shutdown.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            shutdown.cancel();
        });
        self.serve().await
    }

    #[instrument(skip(self), fields(address = %self.handle.local_addr))]
    async fn serve(self) -> Result<()> {
        let shutdown = self.handle.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => self.admit(stream, address),
                    Err(e) => error!(error = %e, "Error accepting connection"),
                },
            }
        }

        info!("Shutting down server. Disconnecting peers...");
        let connections = self.handle.peers.all();
        for connection in &connections {
            connection.disconnect(DisconnectReason::Graceful, "server shutting down");
        }
        let drained = with_timeout_error(
            async {
                for connection in &connections {
                    connection.closed().await;
                }
                Ok(())
            },
            self.config.shutdown_timeout,
        )
        .await;
        match drained {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!("Shutdown timeout reached, forcing exit"),
        }
        Ok(())
    }

    fn admit(&self, mut stream: TcpStream, address: SocketAddr) {
        let client_id = match self.handle.peers.reserve(self.config.max_connections) {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!(%address, "Connection limit reached, rejecting");
                return;
            }
            Err(e) => {
                error!(%address, error = %e, "Could not assign a client id");
                return;
            }
        };

        let peers = Arc::clone(&self.handle.peers);
        let events = self.events_tx.clone();
        let info = self.info.clone();
        let context = self
            .context
            .clone()
            .with_forwarder(Arc::clone(&peers) as Arc<dyn FrameForwarder>);
        let timeout = self.config.handshake_timeout;
        let max_payload_size = context.transport.max_payload_size;

        tokio::spawn(async move {
            let mut remote =
                match server_handshake(&mut stream, client_id, &info, max_payload_size, timeout)
                    .await
                {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!(%address, client_id, error = %e, "Handshake failed");
                        peers.release(client_id);
                        return;
                    }
                };
            remote.address = Some(address);

            let (connection, connection_events) =
                match TcpConnection::new(stream, info, remote.clone(), context) {
                    Ok(started) => started,
                    Err(e) if e.is_registration_error() => {
                        error!(%address, client_id, error = %e, "Setup hook registration failed");
                        peers.release(client_id);
                        return;
                    }
                    Err(e) => {
                        warn!(%address, client_id, error = %e, "Could not start connection");
                        peers.release(client_id);
                        return;
                    }
                };
            if !enlist(&peers, client_id, &connection) {
                return;
            }

            info!(peer = %remote, %address, "Peer connected");
            let _ = events.send(ServerEvent::Connected(remote));
            pump(client_id, connection_events, peers, events).await;
        });
    }
}

/// Publish a started connection in the peer table, closing it when that fails
fn enlist(peers: &PeerTable, client_id: u8, connection: &TcpConnection) -> bool {
    match peers.insert(client_id, connection.clone()) {
        Ok(()) => true,
        Err(e) => {
            error!(client_id, error = %e, "Could not register peer");
            connection.disconnect(DisconnectReason::Interrupted, "server error");
            peers.release(client_id);
            false
        }
    }
}

async fn pump(
    client_id: u8,
    mut stream: EventStream,
    peers: Arc<PeerTable>,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    while let Some(event) = stream.next().await {
        let last = event.is_disconnect();
        if last {
            peers.remove(client_id);
            debug!(client_id, "Peer removed");
        }
        let _ = events.send(ServerEvent::Connection { client_id, event });
        if last {
            break;
        }
    }
}
