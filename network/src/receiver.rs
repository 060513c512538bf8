use crate::protocol::MAX_WIRE_BYTES;
use crate::{MessageQueue, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Listener half of the transport. Each accepted connection carries
/// exactly one message: read it, queue it, echo the ref field back as
/// the ACK, close. No multiplexing.
pub struct InboundService {
    listener: TcpListener,
}

impl InboundService {
    /// A bind failure here is fatal; the caller is expected to exit.
    pub async fn bind(bind_address: SocketAddr) -> Result<InboundService> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| format!("Could not bind listener at {bind_address}: {e:?}"))?;
        Ok(InboundService { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| format!("Could not read listener address: {e:?}").into())
    }

    pub async fn run(self, queue: MessageQueue, cancellation_token: CancellationToken) {
        let bind_address = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        async move {
            info!("Listening for inbound messages");
            loop {
                let Some(accepted) = cancellation_token
                    .run_until_cancelled(self.listener.accept())
                    .await
                else {
                    info!("Inbound listener stopped");
                    return;
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Received connection from {peer}");
                        if let Err(e) = handle_connection(stream, &queue).await {
                            warn!("Dropping inbound connection from {peer}: {e:?}");
                        }
                    }
                    Err(e) => {
                        warn!("Accept failed: {e:?}");
                    }
                }
            }
        }
        .instrument(info_span!("inbound", bind_address = %bind_address))
        .await
    }
}

async fn handle_connection(mut stream: TcpStream, queue: &MessageQueue) -> Result<()> {
    let mut buffer = vec![0u8; MAX_WIRE_BYTES];
    let read = stream
        .read(&mut buffer)
        .await
        .map_err(|e| format!("Read failed: {e:?}"))?;
    let message = std::str::from_utf8(&buffer[..read])
        .map_err(|e| format!("Message is not valid UTF-8: {e:?}"))?
        .to_string();
    info!("Received message: [{message}]");

    // The first comma field is the sender's ref number; echo it back
    // on the same connection as the delivery acknowledgment.
    let ack = message.split(',').next().unwrap_or_default().to_string();

    queue
        .send(message)
        .await
        .map_err(|_| "Inbound queue was closed")?;

    debug!("Sending ACK: [{ack}]");
    stream
        .write_all(ack.as_bytes())
        .await
        .map_err(|e| format!("ACK write failed: {e:?}"))?;
    Ok(())
}
