//! Gateway side of the TCP link
//!
//! Accepts length-prefixed sequence-device frames and answers them from any
//! [`M3Transport`]. Used by `m3srv gateway` to expose a simulated module and
//! by the transport tests.

use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use m3_comlink::{Command, M3Transport, Request, Result};

use super::connection::gateway_codec;
use super::constants::DEFAULT_TIMEOUT_MS;
use super::frame;

/// Serve connections until the listener fails
pub async fn serve_gateway<T>(listener: TcpListener, backend: Arc<T>)
where
    T: M3Transport + ?Sized + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Gateway listening on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Gateway client {}", peer);
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    if let Err(e) = serve_client(stream, backend).await {
                        warn!("Gateway client {} dropped: {}", peer, e);
                    }
                });
            },
            Err(e) => {
                error!("Gateway accept: {}", e);
                return;
            },
        }
    }
}

async fn serve_client<T>(stream: TcpStream, backend: Arc<T>) -> Result<()>
where
    T: M3Transport + ?Sized,
{
    let mut framed = Framed::new(stream, gateway_codec());
    let mut request_id = 0u64;

    while let Some(inbound) = framed.next().await {
        let inbound = inbound?;
        let (routing, cmd) = frame::decode_request(&inbound)?;

        request_id += 1;
        let mut request = Request::new(
            routing,
            Command::SeqDev(cmd.clone()),
            std::time::Duration::from_millis(DEFAULT_TIMEOUT_MS),
        );
        request.id = request_id;

        let reply = backend.transfer(&request).await?;
        let response =
            frame::response_for(routing, &cmd, reply.error_code, reply.data.words().to_vec());

        let mut out = BytesMut::new();
        frame::encode_response(&response, &mut out);
        framed.send(out.freeze()).await?;
    }

    debug!("Gateway client closed");
    Ok(())
}
