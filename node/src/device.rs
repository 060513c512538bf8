use crate::config::DeviceSpec;
use plugd_network::protocol::Timestamp;
use std::net::Ipv4Addr;

/// Devices whose `kind` contains this tag are switchable plugs and take
/// part in the background status sweep.
pub const POLLED_KIND_TAG: &str = "plug";

/// In-memory state for one configured device. Status starts out unknown
/// until the first probe or inbound report updates it.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub kind: String,
    pub addr: Ipv4Addr,
    pub rule: String,
    pub status: String,
    pub last_seen: Timestamp,
}

impl Device {
    pub fn from_spec(spec: &DeviceSpec) -> Self {
        Device {
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            addr: spec.addr,
            rule: spec.rule.clone(),
            status: "unknown".to_string(),
            last_seen: Timestamp::now(),
        }
    }

    pub fn is_polled(&self) -> bool {
        self.kind.contains(POLLED_KIND_TAG)
    }
}
