use plugd_network::protocol::{Endpoint, MessageTypes};
use plugd_network::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl ServiceAddress {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.addr, self.port)
    }
}

/// One configured device. `kind` is the device family tag; plugs are the
/// only kind that gets polled. `rule` names the automation rule a peer
/// applies to this device; it is carried but not interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: String,
    pub addr: Ipv4Addr,
    #[serde(default)]
    pub rule: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceAddress,
    #[serde(default)]
    pub peers: BTreeMap<String, ServiceAddress>,
    pub message_types: MessageTypes,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

pub fn load_config(file: &Path) -> Result<Config> {
    let handle = std::fs::File::open(file)
        .map_err(|e| format!("Could not open config file {}: {e:?}", file.display()))?;
    serde_yaml::from_reader(&handle)
        .map_err(|e| format!("Could not parse config file {}: {e}", file.display()).into())
}
