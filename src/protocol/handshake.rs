//! Connection handshake.
//!
//! Runs once per accepted stream, before the connection engine takes over:
//!
//! ```text
//! server                                  client
//!   | -- [AssignedId(1)] ------------------> |
//!   | -- peer-info frame (server info) ----> |
//!   | <------------- peer-info frame (own) - |
//! ```
//!
//! Both sides read with exact-length reads, so no byte belonging to a later
//! frame is consumed here. Peer info payloads are bincode-encoded [`PeerInfo`].

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::core::codec::{read_frame_exact, write_frame};
use crate::core::frame::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::ids;
use crate::protocol::peer::{PeerInfo, UNASSIGNED_ID};
use crate::utils::timeout::with_timeout_error;

fn encode_info(info: &PeerInfo) -> Result<Frame> {
    Ok(Frame::new(
        ids::PEER_INFO,
        info.client_id(),
        bincode::serialize(info)?,
    ))
}

async fn read_info<S>(stream: &mut S, max_payload_size: usize) -> Result<PeerInfo>
where
    S: AsyncRead + Unpin,
{
    let frame = read_frame_exact(stream, max_payload_size)
        .await
        .map_err(|e| match e {
            ProtocolError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_CLOSED.to_string())
            }
            other => other,
        })?;
    if frame.packet_id != ids::PEER_INFO {
        return Err(ProtocolError::HandshakeError(format!(
            "{} (got packet {})",
            constants::ERR_HANDSHAKE_UNEXPECTED,
            frame.packet_id
        )));
    }
    bincode::deserialize(&frame.payload)
        .map_err(|e| ProtocolError::HandshakeError(format!("peer info: {e}")))
}

/// Server side: assign `assigned_id` to the new peer and exchange peer info.
///
/// Returns the client's announced info.
#[instrument(skip(stream, server_info))]
pub async fn server_handshake<S>(
    stream: &mut S,
    assigned_id: u8,
    server_info: &PeerInfo,
    max_payload_size: usize,
    timeout: Duration,
) -> Result<PeerInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout_error(
        async {
            stream.write_u8(assigned_id).await?;
            write_frame(stream, &encode_info(server_info)?).await?;

            let remote = read_info(stream, max_payload_size).await?;
            if remote.client_id() != assigned_id {
                warn!(
                    announced = remote.client_id(),
                    "Client announced a different id"
                );
                return Err(ProtocolError::HandshakeError(
                    constants::ERR_HANDSHAKE_ID.to_string(),
                ));
            }
            debug!(peer = %remote, "Server handshake complete");
            Ok(remote)
        },
        timeout,
    )
    .await
}

/// Client side: learn the assigned id, then exchange peer info.
///
/// Returns `(local, remote)` where `local` carries the assigned id.
#[instrument(skip(stream))]
pub async fn client_handshake<S>(
    stream: &mut S,
    name: &str,
    max_payload_size: usize,
    timeout: Duration,
) -> Result<(PeerInfo, PeerInfo)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout_error(
        async {
            let assigned = stream.read_u8().await.map_err(|_| {
                ProtocolError::HandshakeError(constants::ERR_HANDSHAKE_CLOSED.to_string())
            })?;
            if assigned == UNASSIGNED_ID {
                return Err(ProtocolError::HandshakeError(
                    constants::ERR_HANDSHAKE_ID.to_string(),
                ));
            }

            let remote = read_info(stream, max_payload_size).await?;
            let mut local = PeerInfo::client(name, None);
            local.assign_id(assigned)?;
            write_frame(stream, &encode_info(&local)?).await?;

            debug!(local = %local, remote = %remote, "Client handshake complete");
            Ok((local, remote))
        },
        timeout,
    )
    .await
}
