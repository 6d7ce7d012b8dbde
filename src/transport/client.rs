//! Client side connector.

use tokio::net::TcpStream;
use tracing::{info, instrument};

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::protocol::handshake::client_handshake;
use crate::transport::connection::{ConnectionContext, EventStream, TcpConnection};
use crate::utils::timeout::with_timeout_error;

/// Connect to `config.client.address`, run the handshake and start the
/// connection. TCP connect and handshake together are bounded by
/// `config.client.connection_timeout`.
#[instrument(skip(config, context), fields(address = %config.client.address))]
pub async fn connect(
    config: &NetworkConfig,
    context: ConnectionContext,
) -> Result<(TcpConnection, EventStream)> {
    let timeout = config.client.connection_timeout;
    let max_payload_size = context.transport.max_payload_size;

    let (stream, local, remote) = with_timeout_error(
        async {
            let mut stream = TcpStream::connect(&config.client.address).await?;
            let (mut local, remote) =
                client_handshake(&mut stream, &config.client.name, max_payload_size, timeout)
                    .await?;
            local.address = stream.local_addr().ok();
            Ok((stream, local, remote))
        },
        timeout,
    )
    .await?;

    info!(local = %local, server = %remote, "Connected");
    TcpConnection::new(stream, local, remote, context)
}

/// [`connect`] with a context built from `config.transport` and the client's
/// response timeout
pub async fn connect_with_defaults(config: &NetworkConfig) -> Result<(TcpConnection, EventStream)> {
    let mut context = ConnectionContext::from_config(&config.transport);
    context.response_timeout = config.client.response_timeout;
    connect(config, context).await
}
