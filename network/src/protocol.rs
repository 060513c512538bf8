use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

/// Transport reads are capped at this many bytes; one message per connection.
pub const MAX_WIRE_BYTES: usize = 200;

pub const REF_MIN: u16 = 100;
pub const REF_MAX: u16 = 999;
pub const PORT_MIN: u16 = 10_000;
pub const PORT_MAX: u16 = 60_000;

const HEADER_FIELDS: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("record has {got} fields, expected at least {need}")]
    TooShort { got: usize, need: usize },
    #[error("reference number out of range: {0}")]
    BadRef(String),
    #[error("port out of range: {0}")]
    BadPort(String),
    #[error("invalid IPv4 address: {0}")]
    BadAddr(String),
    #[error("message type code out of range: {0}")]
    BadType(String),
    #[error("unrecognized message type code: {0}")]
    UnknownType(u16),
    #[error("unrecognized timestamp: {0}")]
    BadTimestamp(String),
}

/// An IPv4 address plus service port, as carried in the message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Endpoint { addr, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Wire timestamp, truncated to whole seconds and rendered as
/// `YYYY-MM-DD HH:MM:SS` (19 characters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    fn from_datetime(dt: NaiveDateTime) -> Self {
        Timestamp(dt.with_nanosecond(0).unwrap_or(dt))
    }

    /// Accepts a full datetime (fractional seconds truncated), a bare
    /// date (merged with the current time of day), or a bare time
    /// (merged with the current date). Anything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
            return Ok(Self::from_datetime(dt));
        }
        if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Ok(Self::from_datetime(date.and_time(Local::now().time())));
        }
        if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M:%S%.f") {
            return Ok(Self::from_datetime(Local::now().date_naive().and_time(time)));
        }
        Err(ProtocolError::BadTimestamp(raw.to_string()))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// The six message kinds this service understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Heartbeat,
    HeartbeatAck,
    GetDeviceState,
    GetDeviceStateAck,
    SetDeviceState,
    SetDeviceStateAck,
}

impl MsgKind {
    /// Total comma-separated fields a record of this kind must carry,
    /// header included.
    pub fn field_count(self) -> usize {
        match self {
            MsgKind::Heartbeat | MsgKind::HeartbeatAck => 6,
            MsgKind::GetDeviceState => 10,
            MsgKind::GetDeviceStateAck => 9,
            MsgKind::SetDeviceState => 11,
            MsgKind::SetDeviceStateAck => 9,
        }
    }
}

/// Mapping from symbolic message kind to the 3-digit wire code, as
/// supplied by configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageTypes {
    pub heartbeat: u16,
    pub heartbeat_ack: u16,
    pub get_device_state: u16,
    pub get_device_state_ack: u16,
    pub set_device_state: u16,
    pub set_device_state_ack: u16,
}

impl MessageTypes {
    pub fn kind_of(&self, code: u16) -> Option<MsgKind> {
        match code {
            c if c == self.heartbeat => Some(MsgKind::Heartbeat),
            c if c == self.heartbeat_ack => Some(MsgKind::HeartbeatAck),
            c if c == self.get_device_state => Some(MsgKind::GetDeviceState),
            c if c == self.get_device_state_ack => Some(MsgKind::GetDeviceStateAck),
            c if c == self.set_device_state => Some(MsgKind::SetDeviceState),
            c if c == self.set_device_state_ack => Some(MsgKind::SetDeviceStateAck),
            _ => None,
        }
    }

    pub fn code_of(&self, kind: MsgKind) -> u16 {
        match kind {
            MsgKind::Heartbeat => self.heartbeat,
            MsgKind::HeartbeatAck => self.heartbeat_ack,
            MsgKind::GetDeviceState => self.get_device_state,
            MsgKind::GetDeviceStateAck => self.get_device_state_ack,
            MsgKind::SetDeviceState => self.set_device_state,
            MsgKind::SetDeviceStateAck => self.set_device_state_ack,
        }
    }
}

/// Variant-specific message body. Device status strings are held in
/// lowercase; `decode` normalizes, builders are expected to pass
/// lowercase values.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Heartbeat,
    HeartbeatAck,
    GetDeviceState {
        name: String,
        addr: Ipv4Addr,
        status: String,
        last_seen: Timestamp,
    },
    GetDeviceStateAck {
        name: String,
        status: String,
        last_seen: Timestamp,
    },
    SetDeviceState {
        name: String,
        addr: Ipv4Addr,
        cmd: String,
        status: String,
        last_seen: Timestamp,
    },
    SetDeviceStateAck {
        name: String,
        status: String,
        last_seen: Timestamp,
    },
}

impl Payload {
    pub fn kind(&self) -> MsgKind {
        match self {
            Payload::Heartbeat => MsgKind::Heartbeat,
            Payload::HeartbeatAck => MsgKind::HeartbeatAck,
            Payload::GetDeviceState { .. } => MsgKind::GetDeviceState,
            Payload::GetDeviceStateAck { .. } => MsgKind::GetDeviceStateAck,
            Payload::SetDeviceState { .. } => MsgKind::SetDeviceState,
            Payload::SetDeviceStateAck { .. } => MsgKind::SetDeviceStateAck,
        }
    }
}

/// One wire message: common header plus variant body. Encoding renders
/// `ref,dest_addr,dest_port,source_addr,source_port,msg_type,<body…>`
/// joined by commas; decoding is the exact inverse.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub ref_num: u16,
    pub dest: Endpoint,
    pub source: Endpoint,
    pub msg_type: u16,
    pub payload: Payload,
}

fn parse_code(raw: &str) -> Option<u16> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|v| (REF_MIN..=REF_MAX).contains(v))
}

fn parse_port(raw: &str) -> Result<u16, ProtocolError> {
    raw.trim()
        .parse::<u16>()
        .ok()
        .filter(|v| (PORT_MIN..=PORT_MAX).contains(v))
        .ok_or_else(|| ProtocolError::BadPort(raw.to_string()))
}

fn parse_addr(raw: &str) -> Result<Ipv4Addr, ProtocolError> {
    raw.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| ProtocolError::BadAddr(raw.to_string()))
}

impl Message {
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{},{},{},{},{},{}",
            self.ref_num,
            self.dest.addr,
            self.dest.port,
            self.source.addr,
            self.source.port,
            self.msg_type
        );
        match &self.payload {
            Payload::Heartbeat | Payload::HeartbeatAck => {}
            Payload::GetDeviceState {
                name,
                addr,
                status,
                last_seen,
            } => {
                out.push_str(&format!(",{name},{addr},{status},{last_seen}"));
            }
            Payload::GetDeviceStateAck {
                name,
                status,
                last_seen,
            }
            | Payload::SetDeviceStateAck {
                name,
                status,
                last_seen,
            } => {
                out.push_str(&format!(",{name},{status},{last_seen}"));
            }
            Payload::SetDeviceState {
                name,
                addr,
                cmd,
                status,
                last_seen,
            } => {
                out.push_str(&format!(",{name},{addr},{cmd},{status},{last_seen}"));
            }
        }
        out
    }

    /// Validates every field atomically; a record that fails any check
    /// is rejected whole rather than partially populated.
    pub fn decode(raw: &str, types: &MessageTypes) -> Result<Message, ProtocolError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = raw.split(',').collect();
        if fields.len() < HEADER_FIELDS {
            return Err(ProtocolError::TooShort {
                got: fields.len(),
                need: HEADER_FIELDS,
            });
        }

        let ref_num =
            parse_code(fields[0]).ok_or_else(|| ProtocolError::BadRef(fields[0].to_string()))?;
        let dest = Endpoint::new(parse_addr(fields[1])?, parse_port(fields[2])?);
        let source = Endpoint::new(parse_addr(fields[3])?, parse_port(fields[4])?);
        let msg_type =
            parse_code(fields[5]).ok_or_else(|| ProtocolError::BadType(fields[5].to_string()))?;
        let kind = types
            .kind_of(msg_type)
            .ok_or(ProtocolError::UnknownType(msg_type))?;

        let need = kind.field_count();
        if fields.len() < need {
            return Err(ProtocolError::TooShort {
                got: fields.len(),
                need,
            });
        }

        let payload = match kind {
            MsgKind::Heartbeat => Payload::Heartbeat,
            MsgKind::HeartbeatAck => Payload::HeartbeatAck,
            MsgKind::GetDeviceState => Payload::GetDeviceState {
                name: fields[6].to_string(),
                addr: parse_addr(fields[7])?,
                status: fields[8].to_lowercase(),
                last_seen: Timestamp::parse(fields[9])?,
            },
            MsgKind::GetDeviceStateAck => Payload::GetDeviceStateAck {
                name: fields[6].to_string(),
                status: fields[7].to_lowercase(),
                last_seen: Timestamp::parse(fields[8])?,
            },
            MsgKind::SetDeviceState => Payload::SetDeviceState {
                name: fields[6].to_string(),
                addr: parse_addr(fields[7])?,
                cmd: fields[8].to_string(),
                status: fields[9].to_lowercase(),
                last_seen: Timestamp::parse(fields[10])?,
            },
            MsgKind::SetDeviceStateAck => Payload::SetDeviceStateAck {
                name: fields[6].to_string(),
                status: fields[7].to_lowercase(),
                last_seen: Timestamp::parse(fields[8])?,
            },
        };

        Ok(Message {
            ref_num,
            dest,
            source,
            msg_type,
            payload,
        })
    }
}

/// Correlation-id allocator. A single instance is owned by the dispatch
/// task, so no locking is needed.
#[derive(Debug)]
pub struct RefCounter {
    value: u16,
}

impl Default for RefCounter {
    fn default() -> Self {
        RefCounter { value: REF_MIN }
    }
}

impl RefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u16) -> Self {
        RefCounter {
            value: value.clamp(REF_MIN, REF_MAX),
        }
    }

    /// Increments and returns the new value, wrapping back to 100 once
    /// it would pass 999.
    pub fn next(&mut self) -> u16 {
        self.value += 1;
        if self.value > REF_MAX {
            self.value = REF_MIN;
        }
        self.value
    }
}
