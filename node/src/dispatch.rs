use crate::device::Device;
use crate::gateway::DeviceGateway;
use plugd_network::protocol::{Endpoint, Message, MessageTypes, Payload, RefCounter};
use plugd_network::{MessageQueue, MessageQueueListener};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// A status sweep walks the device list one device per loop iteration;
/// a new sweep starts once this much time has passed since the last one.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const BUSY_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_INTERVAL: Duration = Duration::from_millis(200);

/// Owns all mutable service state: the ref allocator, the device cache,
/// and the gateway. Runs as a single task, so none of it needs locking.
pub struct Dispatcher<G: DeviceGateway> {
    ref_counter: RefCounter,
    gateway: G,
    msg_in: MessageQueueListener,
    msg_out: MessageQueue,
    service: Endpoint,
    peers: Vec<Endpoint>,
    types: MessageTypes,
    devices: Vec<Device>,
    last_heartbeat: Instant,
    sweep_started: Instant,
    sweep_position: usize,
}

impl<G: DeviceGateway> Dispatcher<G> {
    pub fn new(
        gateway: G,
        msg_in: MessageQueueListener,
        msg_out: MessageQueue,
        service: Endpoint,
        peers: Vec<Endpoint>,
        types: MessageTypes,
        devices: Vec<Device>,
    ) -> Self {
        let sweep_position = devices.len();
        Dispatcher {
            ref_counter: RefCounter::new(),
            gateway,
            msg_in,
            msg_out,
            service,
            peers,
            types,
            devices,
            last_heartbeat: Instant::now(),
            // Backdated so the first sweep starts right away.
            sweep_started: Instant::now()
                .checked_sub(SWEEP_INTERVAL)
                .unwrap_or_else(Instant::now),
            sweep_position,
        }
    }

    pub async fn run(mut self, cancellation_token: CancellationToken) {
        async move {
            info!("Dispatch loop started");
            loop {
                let mut busy = false;
                match self.msg_in.try_recv() {
                    Ok(raw) => {
                        busy = true;
                        if let Some(reply) = self.handle_message(&raw).await {
                            if self.msg_out.send(reply.encode()).await.is_err() {
                                info!("Outbound queue closed, stopping");
                                return;
                            }
                        }
                    }
                    Err(async_channel::TryRecvError::Empty) => {}
                    Err(async_channel::TryRecvError::Closed) => {
                        info!("Inbound queue closed, stopping");
                        return;
                    }
                }

                if self.last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                    self.send_heartbeats().await;
                }
                self.poll_one_device().await;

                let interval = if busy { BUSY_INTERVAL } else { IDLE_INTERVAL };
                if cancellation_token
                    .run_until_cancelled(tokio::time::sleep(interval))
                    .await
                    .is_none()
                {
                    info!("Dispatch loop stopped");
                    return;
                }
            }
        }
        .instrument(info_span!("dispatch"))
        .await
    }

    /// Processes one raw inbound record and returns the reply to send,
    /// if the record warrants one. Records that fail validation are
    /// logged and dropped whole.
    async fn handle_message(&mut self, raw: &str) -> Option<Message> {
        if raw.split(',').count() < 6 {
            debug!("Dropping undersized record: [{raw}]");
            return None;
        }
        let msg = match Message::decode(raw, &self.types) {
            Ok(msg) => msg,
            Err(e @ plugd_network::protocol::ProtocolError::UnknownType(_)) => {
                debug!("Dropping record [{raw}]: {e}");
                return None;
            }
            Err(e) => {
                warn!("Dropping invalid record [{raw}]: {e}");
                return None;
            }
        };

        match msg.payload {
            Payload::Heartbeat => Some(Message {
                ref_num: self.ref_counter.next(),
                dest: msg.source,
                source: msg.dest,
                msg_type: self.types.heartbeat_ack,
                payload: Payload::HeartbeatAck,
            }),
            Payload::GetDeviceState {
                name,
                addr,
                status,
                last_seen,
            } => {
                let (status, last_seen) = self
                    .gateway
                    .read_status(&name, addr, &status, last_seen)
                    .await;
                self.update_device(&name, &status, last_seen);
                Some(Message {
                    ref_num: self.ref_counter.next(),
                    dest: msg.source,
                    source: msg.dest,
                    msg_type: self.types.get_device_state_ack,
                    payload: Payload::GetDeviceStateAck {
                        name,
                        status,
                        last_seen,
                    },
                })
            }
            Payload::SetDeviceState {
                name,
                addr,
                cmd,
                status,
                last_seen,
            } => {
                let (status, last_seen) = match cmd.trim().to_lowercase().as_str() {
                    "1" | "on" => self.gateway.turn_on(&name, addr, last_seen).await,
                    "0" | "off" => self.gateway.turn_off(&name, addr, last_seen).await,
                    other => {
                        warn!("Unrecognized command [{other}] for device [{name}]");
                        (status, last_seen)
                    }
                };
                self.update_device(&name, &status, last_seen);
                Some(Message {
                    ref_num: self.ref_counter.next(),
                    dest: msg.source,
                    source: msg.dest,
                    msg_type: self.types.set_device_state_ack,
                    payload: Payload::SetDeviceStateAck {
                        name,
                        status,
                        last_seen,
                    },
                })
            }
            Payload::HeartbeatAck
            | Payload::GetDeviceStateAck { .. }
            | Payload::SetDeviceStateAck { .. } => {
                debug!("Received ack, ref {}", msg.ref_num);
                None
            }
        }
    }

    fn update_device(
        &mut self,
        name: &str,
        status: &str,
        last_seen: plugd_network::protocol::Timestamp,
    ) {
        if let Some(device) = self.devices.iter_mut().find(|d| d.name == name) {
            device.status = status.to_string();
            device.last_seen = last_seen;
        }
    }

    async fn send_heartbeats(&mut self) {
        self.last_heartbeat = Instant::now();
        for peer in self.peers.clone() {
            let heartbeat = Message {
                ref_num: self.ref_counter.next(),
                dest: peer,
                source: self.service,
                msg_type: self.types.heartbeat,
                payload: Payload::Heartbeat,
            };
            if self.msg_out.send(heartbeat.encode()).await.is_err() {
                warn!("Outbound queue closed, heartbeat to {peer} dropped");
                return;
            }
        }
    }

    /// Advances the status sweep by at most one device. Devices that
    /// are not plugs are skipped without costing an iteration.
    async fn poll_one_device(&mut self) {
        if self.sweep_position >= self.devices.len() {
            if self.sweep_started.elapsed() < SWEEP_INTERVAL {
                return;
            }
            self.sweep_started = Instant::now();
            self.sweep_position = 0;
        }
        while self.sweep_position < self.devices.len() {
            let index = self.sweep_position;
            self.sweep_position += 1;
            if !self.devices[index].is_polled() {
                continue;
            }
            let (name, addr, status, last_seen) = {
                let device = &self.devices[index];
                (
                    device.name.clone(),
                    device.addr,
                    device.status.clone(),
                    device.last_seen,
                )
            };
            let (new_status, new_seen) = self
                .gateway
                .read_status(&name, addr, &status, last_seen)
                .await;
            if new_status != status {
                info!("Device [{name}] changed status: {status} -> {new_status}");
            }
            let device = &mut self.devices[index];
            device.status = new_status;
            device.last_seen = new_seen;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSpec;
    use crate::gateway::DeviceHandle;
    use async_trait::async_trait;
    use plugd_network::protocol::Timestamp;
    use std::net::Ipv4Addr;

    #[derive(Debug, PartialEq, Eq)]
    enum Call {
        ReadStatus(String),
        TurnOn(String),
        TurnOff(String),
    }

    struct MockGateway {
        calls: Vec<Call>,
        status: String,
    }

    impl MockGateway {
        fn reporting(status: &str) -> Self {
            MockGateway {
                calls: Vec::new(),
                status: status.to_string(),
            }
        }
    }

    #[async_trait]
    impl DeviceGateway for MockGateway {
        async fn discover(&mut self, name: &str, addr: Ipv4Addr) -> Option<DeviceHandle> {
            Some(DeviceHandle {
                name: name.to_string(),
                addr,
            })
        }

        async fn read_status(
            &mut self,
            name: &str,
            _addr: Ipv4Addr,
            _status: &str,
            _last_seen: Timestamp,
        ) -> (String, Timestamp) {
            self.calls.push(Call::ReadStatus(name.to_string()));
            (self.status.clone(), Timestamp::now())
        }

        async fn turn_on(
            &mut self,
            name: &str,
            _addr: Ipv4Addr,
            _last_seen: Timestamp,
        ) -> (String, Timestamp) {
            self.calls.push(Call::TurnOn(name.to_string()));
            ("on".to_string(), Timestamp::now())
        }

        async fn turn_off(
            &mut self,
            name: &str,
            _addr: Ipv4Addr,
            _last_seen: Timestamp,
        ) -> (String, Timestamp) {
            self.calls.push(Call::TurnOff(name.to_string()));
            ("off".to_string(), Timestamp::now())
        }
    }

    fn types() -> MessageTypes {
        MessageTypes {
            heartbeat: 101,
            heartbeat_ack: 102,
            get_device_state: 104,
            get_device_state_ack: 105,
            set_device_state: 106,
            set_device_state_ack: 107,
        }
    }

    fn endpoint(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    fn device(name: &str, kind: &str) -> Device {
        Device::from_spec(&DeviceSpec {
            name: name.to_string(),
            kind: kind.to_string(),
            addr: "10.0.0.20".parse().unwrap(),
            rule: String::new(),
        })
    }

    fn dispatcher(
        gateway: MockGateway,
        devices: Vec<Device>,
    ) -> (
        Dispatcher<MockGateway>,
        MessageQueue,
        MessageQueueListener,
    ) {
        let (in_tx, in_rx) = plugd_network::message_queue();
        let (out_tx, out_rx) = plugd_network::message_queue();
        let dispatcher = Dispatcher::new(
            gateway,
            in_rx,
            out_tx,
            endpoint("10.0.0.5", 20000),
            vec![endpoint("10.0.0.9", 20001), endpoint("10.0.0.10", 20002)],
            types(),
            devices,
        );
        (dispatcher, in_tx, out_rx)
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_with_swapped_endpoints() {
        let (mut dispatcher, _in_tx, _out_rx) =
            dispatcher(MockGateway::reporting("on"), Vec::new());
        let reply = dispatcher
            .handle_message("150,10.0.0.5,20000,10.0.0.9,20001,101")
            .await
            .unwrap();
        assert_eq!(reply.msg_type, 102);
        assert_eq!(reply.payload, Payload::HeartbeatAck);
        assert_eq!(reply.dest, endpoint("10.0.0.9", 20001));
        assert_eq!(reply.source, endpoint("10.0.0.5", 20000));
        assert!(dispatcher.gateway.calls.is_empty());
    }

    #[tokio::test]
    async fn get_device_state_reads_through_the_gateway() {
        let (mut dispatcher, _in_tx, _out_rx) = dispatcher(
            MockGateway::reporting("on"),
            vec![device("Lamp1", "smartplug_v1")],
        );
        let reply = dispatcher
            .handle_message("101,10.0.0.5,20000,10.0.0.9,20001,104,Lamp1,10.0.0.20,off,2023-01-01 00:00:00")
            .await
            .unwrap();
        assert_eq!(dispatcher.gateway.calls, [Call::ReadStatus("Lamp1".to_string())]);
        assert_eq!(reply.msg_type, 105);
        assert_eq!(reply.dest, endpoint("10.0.0.9", 20001));
        assert_eq!(reply.source, endpoint("10.0.0.5", 20000));
        match &reply.payload {
            Payload::GetDeviceStateAck {
                name,
                status,
                last_seen,
            } => {
                assert_eq!(name, "Lamp1");
                assert_eq!(status, "on");
                assert_eq!(last_seen.to_string().len(), 19);
            }
            other => panic!("wrong payload: {other:?}"),
        }
        // The cached device picks up the fresh reading.
        assert_eq!(dispatcher.devices[0].status, "on");
    }

    #[tokio::test]
    async fn set_device_state_routes_commands() {
        let (mut dispatcher, _in_tx, _out_rx) =
            dispatcher(MockGateway::reporting("on"), Vec::new());
        let set = |cmd: &str| {
            format!("101,10.0.0.5,20000,10.0.0.9,20001,106,Lamp1,10.0.0.20,{cmd},off,2023-01-01 00:00:00")
        };

        let reply = dispatcher.handle_message(&set("on")).await.unwrap();
        assert_eq!(reply.msg_type, 107);
        dispatcher.handle_message(&set("1")).await.unwrap();
        dispatcher.handle_message(&set("off")).await.unwrap();
        dispatcher.handle_message(&set("0")).await.unwrap();
        assert_eq!(
            dispatcher.gateway.calls,
            [
                Call::TurnOn("Lamp1".to_string()),
                Call::TurnOn("Lamp1".to_string()),
                Call::TurnOff("Lamp1".to_string()),
                Call::TurnOff("Lamp1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unrecognized_command_leaves_state_untouched() {
        let (mut dispatcher, _in_tx, _out_rx) =
            dispatcher(MockGateway::reporting("on"), Vec::new());
        let reply = dispatcher
            .handle_message(
                "101,10.0.0.5,20000,10.0.0.9,20001,106,Lamp1,10.0.0.20,toggle,off,2023-01-01 00:00:00",
            )
            .await
            .unwrap();
        assert!(dispatcher.gateway.calls.is_empty());
        match &reply.payload {
            Payload::SetDeviceStateAck {
                status, last_seen, ..
            } => {
                assert_eq!(status, "off");
                assert_eq!(last_seen.to_string(), "2023-01-01 00:00:00");
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_records_are_dropped() {
        let (mut dispatcher, _in_tx, _out_rx) =
            dispatcher(MockGateway::reporting("on"), Vec::new());
        // Too few fields to be a message at all.
        assert!(dispatcher.handle_message("101,10.0.0.5").await.is_none());
        // Unknown type code.
        assert!(dispatcher
            .handle_message("101,10.0.0.5,20000,10.0.0.9,20001,103")
            .await
            .is_none());
        // Out-of-range port.
        assert!(dispatcher
            .handle_message("101,10.0.0.5,9999,10.0.0.9,20001,101")
            .await
            .is_none());
        assert!(dispatcher.gateway.calls.is_empty());
    }

    #[tokio::test]
    async fn acks_produce_no_reply() {
        let (mut dispatcher, _in_tx, _out_rx) =
            dispatcher(MockGateway::reporting("on"), Vec::new());
        assert!(dispatcher
            .handle_message("150,10.0.0.5,20000,10.0.0.9,20001,102")
            .await
            .is_none());
        assert!(dispatcher
            .handle_message("151,10.0.0.5,20000,10.0.0.9,20001,105,Lamp1,on,2023-01-01 00:00:00")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn heartbeats_go_to_every_peer() {
        let (mut dispatcher, _in_tx, out_rx) =
            dispatcher(MockGateway::reporting("on"), Vec::new());
        dispatcher.send_heartbeats().await;

        let first = out_rx.recv().await.unwrap();
        let second = out_rx.recv().await.unwrap();
        assert_eq!(first, "101,10.0.0.9,20001,10.0.0.5,20000,101");
        assert_eq!(second, "102,10.0.0.10,20002,10.0.0.5,20000,101");
        assert!(out_rx.is_empty());
    }

    #[tokio::test]
    async fn sweep_polls_each_plug_exactly_once() {
        let (mut dispatcher, _in_tx, _out_rx) = dispatcher(
            MockGateway::reporting("on"),
            vec![
                device("lamp1", "smartplug_v1"),
                device("sensor1", "motion"),
                device("lamp2", "plug"),
            ],
        );
        for _ in 0..5 {
            dispatcher.poll_one_device().await;
        }
        // Two plugs in the list, each probed once; the next sweep waits
        // out the interval.
        assert_eq!(
            dispatcher.gateway.calls,
            [
                Call::ReadStatus("lamp1".to_string()),
                Call::ReadStatus("lamp2".to_string()),
            ]
        );
        assert_eq!(dispatcher.devices[0].status, "on");
        assert_eq!(dispatcher.devices[1].status, "unknown");
        assert_eq!(dispatcher.devices[2].status, "on");
    }
}
