use async_trait::async_trait;
use plugd_network::protocol::Timestamp;
use plugd_network::Result;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Status reported when a device cannot be reached. The cached
/// `last_seen` is left untouched so it keeps naming the last real contact.
pub const OFFLINE: &str = "offline";

/// Control port the plugs listen on.
const DEVICE_PORT: u16 = 49153;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Seam between the dispatch loop and the physical plugs. Every call
/// returns the new `(status, last_seen)` pair; an unreachable device
/// yields the offline sentinel with `last_seen` unchanged.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn discover(&mut self, name: &str, addr: Ipv4Addr) -> Option<DeviceHandle>;

    async fn read_status(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        status: &str,
        last_seen: Timestamp,
    ) -> (String, Timestamp);

    async fn turn_on(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        last_seen: Timestamp,
    ) -> (String, Timestamp);

    async fn turn_off(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        last_seen: Timestamp,
    ) -> (String, Timestamp);
}

/// Gateway that talks to real plugs over a one-line TCP command
/// protocol. Once a device has answered a probe it stays on the known
/// list; reachability is re-checked on every command anyway.
#[derive(Default)]
pub struct ProbeGateway {
    known: Vec<DeviceHandle>,
}

impl ProbeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_known(&self, name: &str) -> bool {
        self.known.iter().any(|d| d.name == name)
    }

    async fn command(&self, addr: Ipv4Addr, command: &str) -> Result<String> {
        let connect = TcpStream::connect((addr, DEVICE_PORT));
        let mut stream = tokio::time::timeout(PROBE_TIMEOUT, connect)
            .await
            .map_err(|_| format!("Connect to {addr}:{DEVICE_PORT} timed out"))?
            .map_err(|e| format!("Could not connect to {addr}:{DEVICE_PORT}: {e:?}"))?;
        stream.write_all(format!("{command}\n").as_bytes()).await?;

        let mut buffer = vec![0u8; 64];
        let read = tokio::time::timeout(PROBE_TIMEOUT, stream.read(&mut buffer))
            .await
            .map_err(|_| format!("Reply from {addr}:{DEVICE_PORT} timed out"))??;
        Ok(String::from_utf8_lossy(&buffer[..read]).trim().to_string())
    }

    /// Plugs answer state queries with `0`/`1`; commands echo the state
    /// they switched to.
    fn status_of(reply: &str) -> String {
        match reply {
            "1" => "on".to_string(),
            "0" => "off".to_string(),
            other => other.to_lowercase(),
        }
    }

    async fn run_command(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        command: &str,
        last_seen: Timestamp,
    ) -> (String, Timestamp) {
        if !self.is_known(name) && self.discover(name, addr).await.is_none() {
            return (OFFLINE.to_string(), last_seen);
        }
        match self.command(addr, command).await {
            Ok(reply) => (Self::status_of(&reply), Timestamp::now()),
            Err(e) => {
                warn!("Device [{name}] did not answer [{command}]: {e:?}");
                (OFFLINE.to_string(), last_seen)
            }
        }
    }
}

#[async_trait]
impl DeviceGateway for ProbeGateway {
    async fn discover(&mut self, name: &str, addr: Ipv4Addr) -> Option<DeviceHandle> {
        if let Some(handle) = self.known.iter().find(|d| d.name == name) {
            return Some(handle.clone());
        }
        match self.command(addr, "STATE").await {
            Ok(_) => {
                debug!("Discovered device [{name}] at {addr}");
                let handle = DeviceHandle {
                    name: name.to_string(),
                    addr,
                };
                self.known.push(handle.clone());
                Some(handle)
            }
            Err(e) => {
                debug!("Device [{name}] not found at {addr}: {e:?}");
                None
            }
        }
    }

    async fn read_status(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        _status: &str,
        last_seen: Timestamp,
    ) -> (String, Timestamp) {
        self.run_command(name, addr, "STATE", last_seen).await
    }

    async fn turn_on(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        last_seen: Timestamp,
    ) -> (String, Timestamp) {
        self.run_command(name, addr, "ON", last_seen).await
    }

    async fn turn_off(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        last_seen: Timestamp,
    ) -> (String, Timestamp) {
        self.run_command(name, addr, "OFF", last_seen).await
    }
}
