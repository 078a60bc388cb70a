//! TCP gateway transport
//!
//! Carries sequence-device frames to a remote CPU module over TCP. Each frame
//! is preceded by a big-endian `u16` length. Only the sequence-device family
//! has a wire form; module and system-control commands are refused.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use m3_comlink::{
    Command, ConnectionState, M3Error, M3Transport, Reply, Request, Result,
};

use super::constants::{LENGTH_PREFIX_LEN, MAX_RESPONSE_DATA, RESPONSE_HEADER_LEN};
use super::frame;

type GatewayStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Length-prefixed codec used on both ends of the gateway link
pub fn gateway_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_LEN)
        .max_frame_length(RESPONSE_HEADER_LEN + MAX_RESPONSE_DATA)
        .new_codec()
}

/// Gateway endpoint parameters
#[derive(Debug, Clone)]
pub struct GatewayParams {
    pub host: String,
    pub port: u16,
    /// Slot this process claims as its own
    pub local_slot: u8,
    pub connect_timeout: Duration,
}

/// Transport that talks to a CPU module through a TCP gateway.
///
/// The connection is opened lazily on the first transfer and dropped again
/// whenever an error says the link is gone.
#[derive(Debug)]
pub struct TcpGatewayTransport {
    name: String,
    params: GatewayParams,
    connection: Mutex<Option<GatewayStream>>,
    state: parking_lot::Mutex<ConnectionState>,
}

impl TcpGatewayTransport {
    pub fn new(params: GatewayParams) -> Self {
        Self {
            name: format!("tcp://{}:{}", params.host, params.port),
            params,
            connection: Mutex::new(None),
            state: parking_lot::Mutex::new(ConnectionState::Uninitialized),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    async fn connect(&self) -> Result<GatewayStream> {
        let addr = format!("{}:{}", self.params.host, self.params.port);
        debug!("TCP connecting: {}", addr);
        self.set_state(ConnectionState::Connecting);

        match timeout(self.params.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                self.set_state(ConnectionState::Connected);
                Ok(Framed::new(stream, gateway_codec()))
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                self.set_state(ConnectionState::Disconnected);
                Err(M3Error::connection(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                self.set_state(ConnectionState::Disconnected);
                Err(M3Error::timeout(format!("Connection to {addr} timed out")))
            },
        }
    }

    async fn exchange(stream: &mut GatewayStream, request: &Request, out: BytesMut) -> Result<Reply> {
        let Command::SeqDev(cmd) = &request.command else {
            return Err(M3Error::internal("non-seqdev command reached the wire"));
        };

        stream
            .send(out.freeze())
            .await
            .map_err(|e| M3Error::Io(format!("TCP send error: {e}")))?;

        let inbound = match stream.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => return Err(M3Error::Io(format!("TCP read error: {e}"))),
            None => return Err(M3Error::connection("gateway closed the connection")),
        };
        debug!("TCP RX: {}B", inbound.len());

        let response = frame::decode_response(&inbound)?;
        frame::validate_response(request.routing, cmd, response)
    }

    /// Drop the current connection
    pub async fn disconnect(&self) {
        *self.connection.lock().await = None;
        self.set_state(ConnectionState::Closed);
        debug!("Disconnected");
    }
}

#[async_trait]
impl M3Transport for TcpGatewayTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_local_slot(&self) -> Result<u8> {
        Ok(self.params.local_slot)
    }

    async fn transfer(&self, request: &Request) -> Result<Reply> {
        let Command::SeqDev(cmd) = &request.command else {
            return Err(M3Error::not_supported(format!(
                "{} commands have no gateway encoding",
                request.command.family()
            )));
        };

        let mut out = BytesMut::new();
        frame::encode_request(request.routing, cmd, &mut out)?;

        // Holding the connection lock keeps one exchange on the wire at a time.
        // The stream stays out of the slot until its exchange completes, so a
        // cancelled or timed-out exchange never leaves a late reply behind.
        let mut conn = self.connection.lock().await;
        let mut stream = match conn.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        debug!("TCP TX #{}: {}B", request.id, out.len());
        match timeout(request.timeout, Self::exchange(&mut stream, request, out)).await {
            Ok(Ok(reply)) => {
                *conn = Some(stream);
                Ok(reply)
            },
            Ok(Err(e)) => {
                if e.needs_reconnect() {
                    warn!("Link lost, dropping connection: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    *conn = Some(stream);
                }
                Err(e)
            },
            Err(_) => {
                warn!(
                    "TCP #{} no reply in {}ms, dropping connection",
                    request.id,
                    request.timeout.as_millis()
                );
                self.set_state(ConnectionState::Disconnected);
                Err(M3Error::timeout(format!(
                    "no reply from {} in {}ms",
                    self.name,
                    request.timeout.as_millis()
                )))
            },
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }
}
