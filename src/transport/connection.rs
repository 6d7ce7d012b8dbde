//! # TCP Connection Engine
//!
//! One [`TcpConnection`] per established, handshaken TCP stream. Each connection
//! runs two tasks:
//!
//! - **send loop**: drains an unbounded outbound queue into a
//!   `FramedWrite<_, FrameCodec>`, one frame at a time, in enqueue order
//! - **receive loop**: pulls frames from a [`FrameReader`], resolves them through
//!   the connection's [`DataIds`] registry and reports the outcome as
//!   [`ConnectionEvent`]s
//!
//! A third supervising task waits for both loops and performs the final
//! teardown: outstanding requests are cancelled, the state becomes
//! [`ConnectionState::Closed`] and exactly one `Disconnected` event is emitted.
//!
//! ## Stopping
//! Stop is cooperative through a `CancellationToken`. Frames still queued when
//! the stop is observed are discarded. A disconnect notice set by
//! [`TcpConnection::disconnect`] is written after the queue is abandoned, then
//! the write half is shut down.
//!
//! ## Read errors
//! Reset, aborted, broken or closed sockets and oversized frames end the
//! connection with [`DisconnectReason::Interrupted`]. Other read errors are
//! retried up to `transient_read_retries` times in a row.

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::TransportConfig;
use crate::core::codec::{FrameCodec, FrameReader};
use crate::core::frame::Frame;
use crate::core::serialization::SerializationConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::disconnect::{DisconnectNotice, DisconnectReason};
use crate::protocol::dispatcher::{DataIds, Resolution};
use crate::protocol::event::ConnectionEvent;
use crate::protocol::ids;
use crate::protocol::peer::PeerInfo;
use crate::protocol::request::{RequestCorrelator, SharedResponseProviders};
use crate::protocol::reroute::SharedRerouteTable;
use crate::utils::metrics::{ConnectionMetrics, MetricsSnapshot};
use crate::utils::timeout::{with_optional_timeout, with_timeout_error};

/// Upper bound for writing the disconnect notice on the way out
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(1);

/// Stream of events reported by one connection
pub type EventStream = UnboundedReceiverStream<ConnectionEvent>;

/// Called with the remote peer's info and the fresh registry before the loops
/// start, so registrations are in place for the first inbound frame.
pub type SetupHook = Arc<dyn Fn(&PeerInfo, &DataIds) -> Result<()> + Send + Sync>;

/// Delivers rerouted frames to their destination peer
pub trait FrameForwarder: Send + Sync {
    fn forward(&self, destination: u8, frame: Frame) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closing,
    Closed,
}

/// Everything a connection shares with its owner
#[derive(Clone, Default)]
pub struct ConnectionContext {
    pub transport: TransportConfig,
    pub serialization: SerializationConfig,
    pub reroutes: SharedRerouteTable,
    pub providers: SharedResponseProviders,
    pub forwarder: Option<Arc<dyn FrameForwarder>>,
    pub setup: Option<SetupHook>,
    /// Bound for [`TcpConnection::request`]; `None` waits until the response
    /// arrives or the connection closes
    pub response_timeout: Option<Duration>,
}

impl ConnectionContext {
    pub fn from_config(transport: &TransportConfig) -> Self {
        Self {
            transport: transport.clone(),
            serialization: SerializationConfig::new(transport.serialization_format),
            ..Self::default()
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn FrameForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_setup<F>(mut self, setup: F) -> Self
    where
        F: Fn(&PeerInfo, &DataIds) -> Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(setup));
        self
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("transport", &self.transport)
            .field("serialization", &self.serialization)
            .field("reroutes", &self.reroutes.len())
            .field("forwarder", &self.forwarder.is_some())
            .field("setup", &self.setup.is_some())
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

struct Shared {
    local: PeerInfo,
    remote: RwLock<PeerInfo>,
    remote_id: u8,
    registry: DataIds,
    correlator: RequestCorrelator,
    forwarder: Option<Arc<dyn FrameForwarder>>,
    transport: TransportConfig,
    response_timeout: Option<Duration>,
    outbound: mpsc::UnboundedSender<Frame>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    reason: Mutex<Option<DisconnectReason>>,
    farewell: Mutex<Option<Frame>>,
    shutdown: CancellationToken,
    metrics: ConnectionMetrics,
}

impl Shared {
    fn is_active(&self) -> bool {
        *self.state.borrow() == ConnectionState::Active
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            trace!("Event stream dropped; event discarded");
        }
    }

    fn enqueue(&self, frame: Frame) -> Result<()> {
        if frame.payload.len() > self.transport.max_payload_size {
            return Err(ProtocolError::OversizedPacket(frame.payload.len()));
        }
        if !self.is_active() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Move from `Active` to `Closing`. Only the first caller wins; its reason
    /// is the one reported.
    fn begin_close(&self, reason: DisconnectReason, farewell: Option<Frame>) -> bool {
        let transitioned = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Active {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if transitioned {
            if let Ok(mut slot) = self.reason.lock() {
                *slot = Some(reason);
            }
            if let Some(frame) = farewell {
                if let Ok(mut slot) = self.farewell.lock() {
                    *slot = Some(frame);
                }
            }
            debug!(client_id = self.remote_id, %reason, "Connection closing");
            self.shutdown.cancel();
        }
        transitioned
    }

    fn finish(&self) {
        self.correlator.cancel_all();
        self.state.send_replace(ConnectionState::Closed);
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or(DisconnectReason::Interrupted);
        info!(client_id = self.remote_id, %reason, "Connection closed");
        self.metrics.log_summary(self.remote_id);
        self.emit(ConnectionEvent::Disconnected {
            client_id: self.remote_id,
            reason,
        });
    }

    fn handle_frame(&self, frame: Frame) {
        match self.registry.resolve(&frame) {
            Ok(resolution) => self.apply(frame, resolution),
            Err(e) => {
                self.metrics.undefined_packet();
                debug!(
                    packet_id = frame.packet_id,
                    sender_id = frame.sender_id,
                    error = %e,
                    "Undefined packet"
                );
                self.emit(ConnectionEvent::UndefinedPacket {
                    packet_id: frame.packet_id,
                    sender_id: frame.sender_id,
                    payload: frame.payload,
                });
            }
        }
    }

    fn apply(&self, frame: Frame, resolution: Resolution) {
        match resolution {
            Resolution::Rerouted(rule) => {
                self.metrics.frame_rerouted();
                let forwarded = match &self.forwarder {
                    Some(forwarder) => forwarder.forward(rule.to_client, frame.clone()),
                    None => Err(ProtocolError::Custom(constants::ERR_NO_FORWARDER.to_string())),
                };
                if let Err(e) = forwarded {
                    warn!(
                        packet_id = rule.packet_id,
                        to = rule.to_client,
                        error = %e,
                        "Reroute failed"
                    );
                }
                self.emit(ConnectionEvent::Rerouted {
                    origin: frame.sender_id,
                    destination: rule.to_client,
                    packet_id: frame.packet_id,
                    payload: frame.payload,
                    user_defined: rule.user_defined,
                });
            }
            Resolution::Text(value) => self.emit(ConnectionEvent::StringReceived {
                value,
                sender_id: frame.sender_id,
            }),
            Resolution::Int64(value) => self.emit(ConnectionEvent::Int64Received {
                value,
                sender_id: frame.sender_id,
            }),
            Resolution::Request {
                request_id,
                response: Some(value),
            } => {
                let mut payload = BytesMut::with_capacity(1 + value.len());
                payload.put_u8(request_id);
                payload.put_slice(&value);
                let reply = Frame::new(ids::RESPONSE, self.local.client_id(), payload.freeze());
                if let Err(e) = self.enqueue(reply) {
                    debug!(request_id, error = %e, "Could not queue response");
                }
            }
            Resolution::Request {
                request_id,
                response: None,
            } => {
                warn!(
                    request_id,
                    sender_id = frame.sender_id,
                    "No response provider for request"
                );
                self.emit(ConnectionEvent::RequestUnhandled {
                    request_id,
                    sender_id: frame.sender_id,
                });
            }
            Resolution::Response {
                request_id,
                payload,
            } => {
                match self.correlator.complete(request_id, payload) {
                    Ok(true) => self.metrics.request_completed(),
                    Ok(false) => debug!(request_id, "Response without a waiting request"),
                    Err(e) => warn!(request_id, error = %e, "Response correlation failed"),
                }
                self.emit(ConnectionEvent::ResponseReceived { request_id });
            }
            Resolution::PropertySynced {
                property,
                packet_id,
            } => {
                self.metrics.property_synced();
                self.emit(ConnectionEvent::PropertySynchronized {
                    property,
                    packet_id,
                });
            }
            Resolution::PeerInfo(info) => {
                if info.client_id() != self.remote_id {
                    warn!(
                        announced = info.client_id(),
                        "Peer info for a different client ignored"
                    );
                    self.metrics.undefined_packet();
                    self.emit(ConnectionEvent::UndefinedPacket {
                        packet_id: frame.packet_id,
                        sender_id: frame.sender_id,
                        payload: frame.payload,
                    });
                    return;
                }
                if let Ok(mut remote) = self.remote.write() {
                    *remote = info.clone();
                }
                self.emit(ConnectionEvent::PeerInfoUpdated(info));
            }
            Resolution::Disconnect(notice) => {
                info!(
                    client_id = self.remote_id,
                    reason = %notice.reason,
                    message = %notice.message,
                    "Peer sent disconnect notice"
                );
                self.begin_close(notice.reason, None);
            }
            Resolution::Custom {
                packet_id,
                type_tag,
            } => self.emit(ConnectionEvent::CustomPacket {
                packet_id,
                sender_id: frame.sender_id,
                type_tag,
                payload: frame.payload,
            }),
        }
    }
}

fn is_fatal(error: &ProtocolError) -> bool {
    match error {
        ProtocolError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        ),
        ProtocolError::OversizedPacket(_) => true,
        _ => false,
    }
}

#[instrument(skip_all, fields(client_id = shared.remote_id))]
async fn receive_loop(shared: Arc<Shared>, mut reader: FrameReader<OwnedReadHalf>) {
    let retries = shared.transport.transient_read_retries;
    let mut consecutive_errors = 0u32;

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            next = reader.read_frame() => next,
        };

        match next {
            Ok(Some(frame)) => {
                consecutive_errors = 0;
                shared.metrics.frame_received(frame.encoded_len() as u64);
                trace!(
                    packet_id = frame.packet_id,
                    sender_id = frame.sender_id,
                    len = frame.payload.len(),
                    "Frame received"
                );
                shared.handle_frame(frame);
            }
            Ok(None) => {
                debug!("Peer closed the stream without a disconnect notice");
                shared.begin_close(DisconnectReason::Interrupted, None);
                break;
            }
            Err(e) if is_fatal(&e) => {
                warn!(error = %e, "Read failed, closing connection");
                shared.begin_close(DisconnectReason::Interrupted, None);
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                shared.metrics.transient_read_error();
                if consecutive_errors > retries {
                    error!(error = %e, attempts = consecutive_errors, "Giving up after repeated read errors");
                    shared.begin_close(DisconnectReason::Interrupted, None);
                    break;
                }
                warn!(error = %e, attempt = consecutive_errors, "Transient read error, retrying");
            }
        }
    }
}

#[instrument(skip_all, fields(client_id = shared.remote_id))]
async fn send_loop(
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
) {
    let mut torn_write = false;

    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let len = frame.encoded_len() as u64;
        // an interrupted send leaves any encoded bytes in the write buffer
        let written = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            written = writer.send(frame) => written,
        };

        match written {
            Ok(()) => shared.metrics.frame_sent(len),
            Err(e) => {
                warn!(error = %e, "Write failed, closing connection");
                torn_write = true;
                shared.begin_close(DisconnectReason::Interrupted, None);
                break;
            }
        }
    }

    let dropped = outbound.len();
    outbound.close();
    if dropped > 0 {
        shared.metrics.frames_dropped(dropped as u64);
        debug!(dropped, "Discarding queued frames");
    }

    let farewell = shared.farewell.lock().ok().and_then(|mut slot| slot.take());
    if let Some(notice) = farewell {
        if torn_write {
            debug!("Skipping disconnect notice after an incomplete write");
        } else if let Err(e) = with_timeout_error(writer.send(notice), FAREWELL_TIMEOUT).await {
            debug!(error = %e, "Disconnect notice not delivered");
        }
    }

    let mut half = writer.into_inner();
    if let Err(e) = half.shutdown().await {
        trace!(error = %e, "Write half shutdown failed");
    }
}

async fn supervise(
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    reader: FrameReader<OwnedReadHalf>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
) {
    let receiver = tokio::spawn(receive_loop(Arc::clone(&shared), reader));
    let sender = tokio::spawn(send_loop(Arc::clone(&shared), outbound, writer));

    if let Err(e) = receiver.await {
        error!(error = %e, "Receive loop aborted");
    }
    shared.begin_close(DisconnectReason::Interrupted, None);
    if let Err(e) = sender.await {
        error!(error = %e, "Send loop aborted");
    }
    shared.finish();
}

/// Handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct TcpConnection {
    shared: Arc<Shared>,
}

impl TcpConnection {
    /// Take over a handshaken stream and start its loops.
    ///
    /// `local` and `remote` must carry assigned client IDs. Must be called from
    /// within a tokio runtime.
    pub fn new(
        stream: TcpStream,
        local: PeerInfo,
        remote: PeerInfo,
        context: ConnectionContext,
    ) -> Result<(Self, EventStream)> {
        let registry = DataIds::new(
            local.client_id(),
            context.serialization.clone(),
            Arc::clone(&context.reroutes),
            Arc::clone(&context.providers),
        );
        if let Some(setup) = &context.setup {
            setup(&remote, &registry)?;
        }

        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let codec = FrameCodec::new(context.transport.max_payload_size);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Active);

        let remote_id = remote.client_id();
        info!(local = %local, remote = %remote, "Connection established");

        let shared = Arc::new(Shared {
            local,
            remote: RwLock::new(remote),
            remote_id,
            registry,
            correlator: RequestCorrelator::new(),
            forwarder: context.forwarder,
            transport: context.transport,
            response_timeout: context.response_timeout,
            outbound: outbound_tx,
            events: events_tx,
            state,
            reason: Mutex::new(None),
            farewell: Mutex::new(None),
            shutdown: CancellationToken::new(),
            metrics: ConnectionMetrics::new(),
        });

        tokio::spawn(supervise(
            Arc::clone(&shared),
            outbound_rx,
            FrameReader::new(read_half, codec),
            FramedWrite::new(write_half, codec),
        ));

        Ok((Self { shared }, UnboundedReceiverStream::new(events_rx)))
    }

    pub fn local(&self) -> &PeerInfo {
        &self.shared.local
    }

    /// Own client ID, stamped on every outbound frame
    pub fn client_id(&self) -> u8 {
        self.shared.local.client_id()
    }

    pub fn remote(&self) -> PeerInfo {
        self.shared
            .remote
            .read()
            .map(|remote| remote.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn remote_id(&self) -> u8 {
        self.shared.remote_id
    }

    /// Packet registry used for inbound frames and outbound type checks
    pub fn registry(&self) -> &DataIds {
        &self.shared.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    fn frame(&self, packet_id: u8, payload: impl Into<Bytes>) -> Frame {
        Frame::new(packet_id, self.client_id(), payload)
    }

    pub fn send_string(&self, value: &str) -> Result<()> {
        self.shared
            .enqueue(self.frame(ids::STRING, Bytes::copy_from_slice(value.as_bytes())))
    }

    pub fn send_int64(&self, value: i64) -> Result<()> {
        self.shared
            .enqueue(self.frame(ids::INT64, value.to_le_bytes().to_vec()))
    }

    /// Send `value` under a registered custom packet ID.
    ///
    /// Fails before anything is queued if `packet_id` is not registered for `T`.
    #[instrument(skip(self, value), fields(client_id = self.client_id()))]
    pub fn send_custom<T: Serialize + 'static>(&self, packet_id: u8, value: &T) -> Result<()> {
        self.shared.registry.check_custom::<T>(packet_id)?;
        let payload = self.shared.registry.serialization().serialize(value)?;
        self.shared.enqueue(self.frame(packet_id, payload))
    }

    /// Send a payload under any packet ID without registry checks
    pub fn send_raw(&self, packet_id: u8, payload: impl Into<Bytes>) -> Result<()> {
        self.shared.enqueue(self.frame(packet_id, payload))
    }

    /// Queue a frame unchanged, keeping its original sender ID
    pub fn forward_frame(&self, frame: Frame) -> Result<()> {
        self.shared.enqueue(frame)
    }

    /// Push a property value to the remote peer's binding for `packet_id`
    pub fn publish<T: Serialize + 'static>(&self, packet_id: u8, value: &T) -> Result<()> {
        let value = self.shared.registry.serialization().serialize(value)?;
        self.send_property(packet_id, &value)
    }

    /// Push the current value of the local binding for `packet_id`
    pub fn publish_bound(&self, packet_id: u8) -> Result<()> {
        let binding = self
            .shared
            .registry
            .binding(packet_id)
            .ok_or(ProtocolError::PropertyNotBound(packet_id))?;
        let value = binding.current_value(self.shared.registry.serialization())?;
        self.send_property(packet_id, &value)
    }

    fn send_property(&self, packet_id: u8, value: &[u8]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(1 + value.len());
        payload.put_u8(packet_id);
        payload.put_slice(value);
        self.shared
            .enqueue(self.frame(ids::PROPERTY_SYNC, payload.freeze()))
    }

    /// Ask the remote peer for the value behind `request_id`.
    ///
    /// `T` must have been declared with [`DataIds::declare_response`]. Waits
    /// until the response arrives, the connection closes or the context's
    /// `response_timeout` elapses.
    #[instrument(skip(self), fields(client_id = self.client_id()))]
    pub async fn request<T: DeserializeOwned + 'static>(&self, request_id: u8) -> Result<T> {
        with_optional_timeout(self.exchange(request_id), self.shared.response_timeout).await
    }

    /// [`TcpConnection::request`] bounded by `timeout`
    pub async fn request_timeout<T: DeserializeOwned + 'static>(
        &self,
        request_id: u8,
        timeout: Duration,
    ) -> Result<T> {
        with_timeout_error(self.exchange(request_id), timeout).await
    }

    async fn exchange<T: DeserializeOwned + 'static>(&self, request_id: u8) -> Result<T> {
        self.shared.registry.check_response::<T>(request_id)?;
        if !self.is_active() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let pending = self.shared.correlator.register(request_id)?;
        self.shared
            .enqueue(self.frame(ids::REQUEST, vec![request_id]))?;
        let payload = pending.wait().await?;
        self.shared.registry.serialization().deserialize(&payload)
    }

    /// Start closing: send a notice carrying `reason`, then stop both loops.
    ///
    /// Returns `false` if the connection was already closing.
    pub fn disconnect(&self, reason: DisconnectReason, message: &str) -> bool {
        let farewell = DisconnectNotice::new(reason, message)
            .to_payload()
            .map(|payload| self.frame(ids::DISCONNECT, payload))
            .map_err(|e| warn!(error = %e, "Could not encode disconnect notice"))
            .ok();
        self.shared.begin_close(reason, farewell)
    }

    pub fn kick(&self, message: &str) -> bool {
        self.disconnect(DisconnectReason::Kicked, message)
    }

    /// Graceful disconnect
    pub fn dispose(&self) -> bool {
        self.disconnect(DisconnectReason::Graceful, "")
    }

    /// Wait until both loops have stopped
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("local", &self.shared.local)
            .field("remote_id", &self.shared.remote_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
