use crate::protocol::MAX_WIRE_BYTES;
use crate::{MessageQueueListener, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Poll interval after an iteration that sent a message.
const BUSY_INTERVAL: Duration = Duration::from_millis(50);
/// Poll interval when the outbound queue was empty.
const IDLE_INTERVAL: Duration = Duration::from_millis(200);

/// Drains the outbound queue: one connection per message, write the
/// encoded record, wait for the byte-level ACK, close. Failures drop
/// the message; there is no retry or requeue.
pub async fn run_outbound(queue: MessageQueueListener, cancellation_token: CancellationToken) {
    async move {
        info!("Outbound message task started");
        loop {
            let mut busy = false;
            match queue.try_recv() {
                Ok(message) => {
                    busy = true;
                    if let Err(e) = send_message(&message).await {
                        warn!("Dropping outbound message [{message}]: {e:?}");
                    }
                }
                Err(async_channel::TryRecvError::Empty) => {}
                Err(async_channel::TryRecvError::Closed) => {
                    info!("Outbound queue closed, stopping");
                    return;
                }
            }

            let interval = if busy { BUSY_INTERVAL } else { IDLE_INTERVAL };
            if cancellation_token
                .run_until_cancelled(tokio::time::sleep(interval))
                .await
                .is_none()
            {
                info!("Outbound message task stopped");
                return;
            }
        }
    }
    .instrument(info_span!("outbound"))
    .await
}

async fn send_message(raw: &str) -> Result<()> {
    let mut fields = raw.split(',');
    let (addr, port) = match (fields.nth(1), fields.next()) {
        (Some(addr), Some(port)) => {
            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|_| format!("Bad destination address [{addr}]"))?;
            let port: u16 = port
                .parse()
                .map_err(|_| format!("Bad destination port [{port}]"))?;
            (addr, port)
        }
        _ => return Err("Message is missing destination fields".into()),
    };

    debug!("Opening outgoing connection to {addr}:{port}");
    let mut stream = TcpStream::connect((addr, port))
        .await
        .map_err(|e| format!("Could not connect to {addr}:{port}: {e:?}"))?;
    info!("Sending message: [{raw}]");
    stream
        .write_all(raw.as_bytes())
        .await
        .map_err(|e| format!("Write to {addr}:{port} failed: {e:?}"))?;

    let mut buffer = vec![0u8; MAX_WIRE_BYTES];
    let read = stream
        .read(&mut buffer)
        .await
        .map_err(|e| format!("ACK read from {addr}:{port} failed: {e:?}"))?;
    debug!(
        "Received ACK: [{}]",
        String::from_utf8_lossy(&buffer[..read])
    );
    Ok(())
}
