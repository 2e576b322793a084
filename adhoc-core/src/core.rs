//! Host-driven protocol core: owns config, registry and transport, advances
//! timers on `tick`, dispatches inbound frames and notifies host handlers.

use std::fmt;
use std::sync::mpsc;

use tracing::{debug, info, trace, warn};

use crate::config::{ProtocolConfig, SecurityKeys};
use crate::discovery::{self, Admission, Rejection};
use crate::identity::{GroupId, MacAddr};
use crate::liveness::{self, FanOutReport, IntervalTimer};
use crate::protocol::{Command, ProtocolMessage, Role, MAX_PAYLOAD_LEN};
use crate::registry::{PeerInfo, PeerRegistry};
use crate::transport::{Transport, TransportError};
use crate::wire::{FormatError, MessageCodec};

/// Lifecycle of a node. Timers fire and frames dispatch only while `Running`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NodeState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Uninitialized => "uninitialized",
            NodeState::Running => "running",
            NodeState::ShuttingDown => "shutting down",
            NodeState::Stopped => "stopped",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport failed to start: {0}")]
    TransportInit(#[source] TransportError),
    #[error("{op} not allowed while {state}")]
    InvalidState { state: NodeState, op: &'static str },
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Peer joined (`connected`) or was evicted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeerEvent {
    pub mac: MacAddr,
    pub role: Role,
    pub connected: bool,
}

/// Data handler: `(source, message, was_broadcast)`.
pub type DataHandler = Box<dyn FnMut(MacAddr, &ProtocolMessage, bool) + Send>;
pub type PeerHandler = Box<dyn FnMut(PeerEvent) + Send>;

/// Raw frame as delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub src: MacAddr,
    pub bytes: Vec<u8>,
    pub broadcast: bool,
}

/// Cloneable entry point for the transport's receive context. Frames are
/// queued and dispatched inside the next `tick`, never concurrently with it.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<InboundFrame>,
}

impl FrameSink {
    /// Queue a frame. Returns false once the core is gone.
    pub fn deliver(&self, src: MacAddr, bytes: &[u8], broadcast: bool) -> bool {
        self.tx
            .send(InboundFrame {
                src,
                bytes: bytes.to_vec(),
                broadcast,
            })
            .is_ok()
    }
}

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Registration(Admission),
    Heartbeat,
    /// Handed to the data handlers.
    Delivered,
    Dropped(Rejection),
    Malformed(FormatError),
    /// Not running, or our own frame echoed back.
    Ignored,
}

/// Work done by one `tick`.
#[derive(Debug, Default)]
pub struct TickReport {
    pub inbound: usize,
    pub advertised: bool,
    pub heartbeats: Option<FanOutReport>,
    pub evicted: Vec<PeerInfo>,
}

/// One line of [`NodeStatus`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeerStatus {
    pub mac: MacAddr,
    pub role: Role,
    pub age_ms: u64,
}

/// Snapshot for status displays.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub state: NodeState,
    pub role: Role,
    pub secure: bool,
    pub channel: u8,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub server_peers: usize,
    pub client_peers: usize,
    pub peers: Vec<PeerStatus>,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} security={} channel={} heartbeat={}ms timeout={}ms",
            self.role,
            self.state,
            if self.secure { "on" } else { "off" },
            self.channel,
            self.heartbeat_interval_ms,
            self.heartbeat_timeout_ms
        )?;
        write!(
            f,
            "peers: {} total, {} server, {} client",
            self.peers.len(),
            self.server_peers,
            self.client_peers
        )?;
        for (i, p) in self.peers.iter().enumerate() {
            write!(f, "\n  peer {i}: {} [{}] last seen {} ms ago", p.mac, p.role, p.age_ms)?;
        }
        Ok(())
    }
}

/// Protocol engine for one node, generic over the radio transport.
pub struct ProtocolCore<T: Transport> {
    config: ProtocolConfig,
    codec: MessageCodec,
    keys: Option<SecurityKeys>,
    transport: T,
    state: NodeState,
    registry: PeerRegistry<T::Handle>,
    broadcast: Option<T::Handle>,
    advertise_timer: IntervalTimer,
    heartbeat_timer: IntervalTimer,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: mpsc::Receiver<InboundFrame>,
    data_handlers: Vec<DataHandler>,
    peer_handlers: Vec<PeerHandler>,
}

impl<T: Transport> ProtocolCore<T> {
    pub fn new(config: ProtocolConfig, transport: T) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            codec: MessageCodec::new(config.payload_len),
            advertise_timer: IntervalTimer::new(config.advertise_interval_ms),
            heartbeat_timer: IntervalTimer::new(config.heartbeat_interval_ms),
            config,
            keys: None,
            transport,
            state: NodeState::Uninitialized,
            registry: PeerRegistry::new(),
            broadcast: None,
            inbound_tx,
            inbound_rx,
            data_handlers: Vec::new(),
            peer_handlers: Vec::new(),
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Handle for the transport's receive path.
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            tx: self.inbound_tx.clone(),
        }
    }

    pub fn add_data_handler<F>(&mut self, handler: F)
    where
        F: FnMut(MacAddr, &ProtocolMessage, bool) + Send + 'static,
    {
        self.data_handlers.push(Box::new(handler));
    }

    pub fn add_peer_handler<F>(&mut self, handler: F)
    where
        F: FnMut(PeerEvent) + Send + 'static,
    {
        self.peer_handlers.push(Box::new(handler));
    }

    // ---- configuration ----

    pub fn set_role(&mut self, role: Role) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_role")?;
        self.config.role = role;
        Ok(())
    }

    /// Security mode and keys. Keys go to the transport at `begin`, so this is
    /// only allowed before it.
    pub fn set_security(
        &mut self,
        enabled: bool,
        network_key: Option<String>,
        link_key: Option<String>,
    ) -> Result<(), CoreError> {
        if self.state != NodeState::Uninitialized {
            return Err(self.invalid("set_security"));
        }
        self.config.secure = enabled;
        self.config.network_key = network_key;
        self.config.link_key = link_key;
        Ok(())
    }

    pub fn set_advertise_interval(&mut self, interval_ms: u64) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_advertise_interval")?;
        self.config.advertise_interval_ms = interval_ms;
        self.advertise_timer.set_interval(interval_ms);
        Ok(())
    }

    pub fn set_heartbeat_interval(&mut self, interval_ms: u64) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_heartbeat_interval")?;
        self.config.heartbeat_interval_ms = interval_ms;
        self.heartbeat_timer.set_interval(interval_ms);
        Ok(())
    }

    pub fn set_heartbeat_timeout(&mut self, timeout_ms: u64) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_heartbeat_timeout")?;
        self.config.heartbeat_timeout_ms = timeout_ms;
        Ok(())
    }

    /// Replace either group id; `None` keeps the current one.
    pub fn set_group_ids(
        &mut self,
        adv_group_id: Option<GroupId>,
        group_id: Option<GroupId>,
    ) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_group_ids")?;
        if let Some(id) = adv_group_id {
            self.config.adv_group_id = id;
        }
        if let Some(id) = group_id {
            self.config.group_id = id;
        }
        Ok(())
    }

    pub fn set_channel(&mut self, channel: u8) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_channel")?;
        self.config.channel = channel;
        if self.state == NodeState::Running {
            self.transport.set_channel(channel);
        }
        Ok(())
    }

    /// When enabled, a client drops everything but REGISTER from other clients.
    pub fn set_role_filter(&mut self, enabled: bool) -> Result<(), CoreError> {
        self.ensure_not_stopped("set_role_filter")?;
        self.config.role_filter = enabled;
        Ok(())
    }

    // ---- lifecycle ----

    /// Start the transport and the broadcast handle. On error the node stays
    /// `Uninitialized` and `begin` may be retried.
    pub fn begin(&mut self) -> Result<(), CoreError> {
        if self.state != NodeState::Uninitialized {
            return Err(self.invalid("begin"));
        }
        let payload_len = self.config.payload_len;
        if payload_len == 0 || payload_len > MAX_PAYLOAD_LEN {
            return Err(CoreError::Configuration(format!(
                "payload_len {payload_len} outside 1..={MAX_PAYLOAD_LEN}"
            )));
        }
        let keys = self
            .config
            .security_keys()
            .map_err(CoreError::Configuration)?;
        self.transport
            .start(keys.as_ref().map(|k| &k.network))
            .map_err(CoreError::TransportInit)?;
        self.transport.set_channel(self.config.channel);
        let broadcast = match self
            .transport
            .register_peer(MacAddr::BROADCAST, self.config.channel, None)
        {
            Ok(h) => h,
            Err(e) => {
                self.transport.stop();
                return Err(CoreError::TransportInit(e));
            }
        };
        // Frames queued before the radio was up are stale.
        let stale = self.inbound_rx.try_iter().count();
        if stale > 0 {
            debug!(stale, "discarded frames queued before begin");
        }
        self.keys = keys;
        self.broadcast = Some(broadcast);
        self.advertise_timer.reset();
        self.heartbeat_timer.reset();
        self.state = NodeState::Running;
        info!(
            role = %self.config.role,
            secure = self.config.secure,
            channel = self.config.channel,
            mac = %self.transport.local_mac(),
            adv_group = %self.config.adv_group_id,
            group = %self.config.group_id,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
            "node started"
        );
        Ok(())
    }

    /// Release the broadcast handle, every peer handle, then the transport.
    /// No disconnect events are emitted for peers dropped here.
    pub fn shutdown(&mut self) -> Result<(), CoreError> {
        match self.state {
            NodeState::Stopped => return Err(self.invalid("shutdown")),
            NodeState::Uninitialized => {
                self.state = NodeState::Stopped;
                return Ok(());
            }
            NodeState::Running | NodeState::ShuttingDown => {}
        }
        self.state = NodeState::ShuttingDown;
        if let Some(handle) = self.broadcast.take() {
            self.transport.unregister_peer(handle);
        }
        let peers = self.registry.drain();
        let released = peers.len();
        for record in peers {
            self.transport.unregister_peer(record.into_handle());
        }
        while self.inbound_rx.try_recv().is_ok() {}
        self.transport.stop();
        self.state = NodeState::Stopped;
        info!(released, "node stopped");
        Ok(())
    }

    /// Advance the node to `now_ms` (monotonic milliseconds): dispatch queued
    /// frames, then advertise, heartbeat and sweep as due. No-op unless running.
    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        let mut report = TickReport::default();
        if self.state != NodeState::Running {
            return report;
        }
        while let Ok(frame) = self.inbound_rx.try_recv() {
            self.dispatch(frame, now_ms);
            report.inbound += 1;
        }
        if self.advertise_timer.poll(now_ms) {
            report.advertised = self.advertise();
        }
        if self.heartbeat_timer.poll(now_ms) {
            report.heartbeats = Some(liveness::send_heartbeats(
                &self.codec,
                &self.config,
                &self.registry,
                &mut self.transport,
            ));
        }
        report.evicted = liveness::sweep(
            &mut self.registry,
            &mut self.transport,
            now_ms,
            self.config.heartbeat_timeout_ms,
        );
        for info in &report.evicted {
            self.emit_peer(PeerEvent {
                mac: info.mac,
                role: info.role,
                connected: false,
            });
        }
        report
    }

    /// Dispatch a frame immediately. For hosts that already serialize access
    /// to the core; otherwise deliver through [`frame_sink`](Self::frame_sink).
    pub fn on_frame(&mut self, src: MacAddr, bytes: &[u8], broadcast: bool, now_ms: u64) -> Inbound {
        if self.state != NodeState::Running {
            return Inbound::Ignored;
        }
        self.dispatch(
            InboundFrame {
                src,
                bytes: bytes.to_vec(),
                broadcast,
            },
            now_ms,
        )
    }

    fn dispatch(&mut self, frame: InboundFrame, now_ms: u64) -> Inbound {
        let src = frame.src;
        if src == self.transport.local_mac() {
            return Inbound::Ignored;
        }
        let msg = match self.codec.decode(&frame.bytes) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(%src, "dropping frame: {e}");
                return Inbound::Malformed(e);
            }
        };
        if msg.command == Command::Register {
            let outcome = discovery::admit(
                &self.config,
                self.keys.as_ref().map(|k| &k.link),
                &mut self.registry,
                &mut self.transport,
                src,
                &msg,
                now_ms,
            );
            if let Admission::Admitted(info) = &outcome {
                self.emit_peer(PeerEvent {
                    mac: info.mac,
                    role: info.role,
                    connected: true,
                });
            }
            return Inbound::Registration(outcome);
        }
        if let Err(reason) = self.accept(&src, &msg) {
            trace!(%src, %reason, "dropping frame");
            return Inbound::Dropped(reason);
        }
        self.registry.touch(&src, now_ms);
        match msg.command {
            Command::Heartbeat => {
                debug!(%src, broadcast = frame.broadcast, "heartbeat received");
                Inbound::Heartbeat
            }
            _ => {
                for handler in &mut self.data_handlers {
                    handler(src, &msg, frame.broadcast);
                }
                Inbound::Delivered
            }
        }
    }

    /// Acceptance rules for post-registration traffic.
    fn accept(&self, src: &MacAddr, msg: &ProtocolMessage) -> Result<(), Rejection> {
        if msg.group_id != self.config.group_id {
            return Err(Rejection::GroupMismatch);
        }
        let peer = self.registry.get(src).ok_or(Rejection::UnknownPeer)?;
        if msg.secure != peer.secure() {
            return Err(Rejection::SecurityMismatch);
        }
        if self.config.role_filter && self.config.role == Role::Client && msg.role == Role::Client {
            return Err(Rejection::RoleFiltered);
        }
        Ok(())
    }

    fn advertise(&mut self) -> bool {
        let Some(handle) = &self.broadcast else {
            return false;
        };
        let msg = discovery::advertisement(&self.codec, &self.config, self.transport.local_mac());
        let frame = match self.codec.encode(&msg) {
            Ok(f) => f,
            Err(e) => {
                warn!("advertisement encode failed: {e}");
                return false;
            }
        };
        let sent = self.transport.send(handle, &frame);
        if sent {
            debug!("broadcast advertisement sent");
        } else {
            warn!("broadcast advertisement send failed");
        }
        sent
    }

    fn emit_peer(&mut self, event: PeerEvent) {
        for handler in &mut self.peer_handlers {
            handler(event);
        }
    }

    // ---- sending ----

    /// DATA message on the operational group carrying `payload`.
    pub fn data_message(&self, payload: &[u8]) -> Result<ProtocolMessage, CoreError> {
        let mut msg = self.codec.message(
            self.config.group_id.clone(),
            self.config.role,
            self.config.channel,
            self.config.secure,
            Command::Data,
        );
        if !msg.set_payload(payload) {
            return Err(FormatError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.codec.payload_len(),
            }
            .into());
        }
        Ok(msg)
    }

    /// Send `payload` to every peer. `Ok(true)` only if every send succeeded.
    pub fn send_to_all(&mut self, payload: &[u8]) -> Result<bool, CoreError> {
        self.send_data(payload, None)
    }

    pub fn send_to_servers(&mut self, payload: &[u8]) -> Result<bool, CoreError> {
        self.send_data(payload, Some(Role::Server))
    }

    pub fn send_to_clients(&mut self, payload: &[u8]) -> Result<bool, CoreError> {
        self.send_data(payload, Some(Role::Client))
    }

    /// Broadcast `payload` as DATA; registered peers receive it with `broadcast = true`.
    pub fn send_broadcast(&mut self, payload: &[u8]) -> Result<bool, CoreError> {
        self.ensure_running("send_broadcast")?;
        let frame = self.codec.encode(&self.data_message(payload)?)?;
        Ok(match &self.broadcast {
            Some(handle) => self.transport.send(handle, &frame),
            None => false,
        })
    }

    fn send_data(&mut self, payload: &[u8], role: Option<Role>) -> Result<bool, CoreError> {
        self.ensure_running("send")?;
        let frame = self.codec.encode(&self.data_message(payload)?)?;
        let mut all_ok = true;
        for peer in self
            .registry
            .iter()
            .filter(|p| role.map_or(true, |r| p.role() == r))
        {
            if !self.transport.send(peer.handle(), &frame) {
                warn!(mac = %peer.mac(), "data send failed");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    // ---- queries ----

    pub fn total_peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn server_peer_count(&self) -> usize {
        self.registry.count_role(Role::Server)
    }

    pub fn client_peer_count(&self) -> usize {
        self.registry.count_role(Role::Client)
    }

    /// Milliseconds since `mac` was last heard from, if registered.
    pub fn last_seen_age(&self, mac: &MacAddr, now_ms: u64) -> Option<u64> {
        self.registry.last_seen_age(mac, now_ms)
    }

    /// Registered peers ordered by address.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self.registry.iter().map(PeerInfo::from).collect();
        out.sort_by_key(|p| p.mac);
        out
    }

    pub fn status(&self, now_ms: u64) -> NodeStatus {
        NodeStatus {
            state: self.state,
            role: self.config.role,
            secure: self.config.secure,
            channel: self.config.channel,
            heartbeat_interval_ms: self.config.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.config.heartbeat_timeout_ms,
            server_peers: self.server_peer_count(),
            client_peers: self.client_peer_count(),
            peers: self
                .peers()
                .into_iter()
                .map(|p| PeerStatus {
                    mac: p.mac,
                    role: p.role,
                    age_ms: now_ms.saturating_sub(p.last_seen),
                })
                .collect(),
        }
    }

    /// Encoded size of every message.
    pub fn message_size(&self) -> usize {
        self.codec.frame_len()
    }

    pub fn payload_capacity(&self) -> usize {
        self.codec.payload_len()
    }

    fn ensure_running(&self, op: &'static str) -> Result<(), CoreError> {
        if self.state != NodeState::Running {
            return Err(self.invalid(op));
        }
        Ok(())
    }

    fn ensure_not_stopped(&self, op: &'static str) -> Result<(), CoreError> {
        if self.state == NodeState::Stopped {
            return Err(self.invalid(op));
        }
        Ok(())
    }

    fn invalid(&self, op: &'static str) -> CoreError {
        CoreError::InvalidState {
            state: self.state,
            op,
        }
    }
}

impl<T: Transport> Drop for ProtocolCore<T> {
    fn drop(&mut self) {
        if self.state == NodeState::Running {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::memory::{MemoryTransport, TransportOp};
    use crate::wire::HEADER_LEN;

    const LOCAL: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 0xAA]);

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0x02, 0, 0, 0, 0, n])
    }

    fn running(role: Role) -> ProtocolCore<MemoryTransport> {
        let mut core = ProtocolCore::new(ProtocolConfig::with_role(role), MemoryTransport::new(LOCAL));
        core.begin().unwrap();
        core
    }

    fn frame(core: &ProtocolCore<MemoryTransport>, msg: &ProtocolMessage) -> Vec<u8> {
        MessageCodec::new(core.payload_capacity()).encode(msg).unwrap()
    }

    fn register_from(core: &ProtocolCore<MemoryTransport>, role: Role) -> Vec<u8> {
        let mut c = core.config().clone();
        c.role = role;
        let codec = MessageCodec::new(core.payload_capacity());
        codec.encode(&discovery::advertisement(&codec, &c, mac(0xEE))).unwrap()
    }

    fn data_from(core: &ProtocolCore<MemoryTransport>, role: Role, text: &str) -> ProtocolMessage {
        let mut msg = core.data_message(&[]).unwrap();
        msg.role = role;
        msg.set_text(text);
        msg
    }

    #[test]
    fn begin_requires_both_keys_when_secure() {
        let mut config = ProtocolConfig::with_role(Role::Server);
        config.secure = true;
        config.network_key = Some("pmk".into());
        let mut core = ProtocolCore::new(config, MemoryTransport::new(LOCAL));
        assert!(matches!(core.begin(), Err(CoreError::Configuration(_))));
        assert_eq!(core.state(), NodeState::Uninitialized);
        assert!(core.transport().ops().is_empty());

        core.set_security(true, Some("pmk".into()), Some("lmk".into()))
            .unwrap();
        core.begin().unwrap();
        assert_eq!(core.state(), NodeState::Running);
        assert_eq!(core.transport().ops()[0], TransportOp::Start { secure: true });
        assert!(core.set_security(false, None, None).is_err());
    }

    #[test]
    fn transport_failure_keeps_node_uninitialized() {
        let mut transport = MemoryTransport::new(LOCAL);
        transport.fail_start();
        let mut core = ProtocolCore::new(ProtocolConfig::default(), transport);
        assert!(matches!(core.begin(), Err(CoreError::TransportInit(_))));
        assert_eq!(core.state(), NodeState::Uninitialized);
        core.begin().unwrap();
        assert!(core.transport().is_registered(MacAddr::BROADCAST));
    }

    #[test]
    fn begin_rejects_unusable_payload_len() {
        for payload_len in [0, MAX_PAYLOAD_LEN + 1, usize::MAX] {
            let mut config = ProtocolConfig::with_role(Role::Server);
            config.payload_len = payload_len;
            let mut core = ProtocolCore::new(config, MemoryTransport::new(LOCAL));
            assert!(matches!(core.begin(), Err(CoreError::Configuration(_))));
            assert_eq!(core.state(), NodeState::Uninitialized);
            assert!(core.transport().ops().is_empty());
        }

        let mut config = ProtocolConfig::with_role(Role::Server);
        config.payload_len = MAX_PAYLOAD_LEN;
        let mut core = ProtocolCore::new(config, MemoryTransport::new(LOCAL));
        core.begin().unwrap();
        assert_eq!(core.message_size(), HEADER_LEN + MAX_PAYLOAD_LEN);
    }

    #[test]
    fn frames_queued_before_begin_are_discarded() {
        let mut core = ProtocolCore::new(
            ProtocolConfig::with_role(Role::Server),
            MemoryTransport::new(LOCAL),
        );
        let sink = core.frame_sink();
        let reg = register_from(&core, Role::Client);
        assert!(sink.deliver(mac(1), &reg, true));

        core.begin().unwrap();
        let report = core.tick(10_000);
        assert_eq!(report.inbound, 0);
        assert_eq!(core.total_peer_count(), 0);

        // The sink stays usable once running.
        assert!(sink.deliver(mac(1), &reg, true));
        assert_eq!(core.tick(10_001).inbound, 1);
        assert_eq!(core.total_peer_count(), 1);
    }

    #[test]
    fn every_registered_handler_fires() {
        let mut core = running(Role::Server);
        let data = Arc::new(Mutex::new(Vec::new()));
        let peers = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let data = data.clone();
            core.add_data_handler(move |src, msg, _| {
                data.lock().unwrap().push((id, src, msg.payload_text()))
            });
            let peers = peers.clone();
            core.add_peer_handler(move |e| peers.lock().unwrap().push((id, e.mac, e.connected)));
        }

        let reg = register_from(&core, Role::Client);
        core.on_frame(mac(1), &reg, true, 0);
        let hello = frame(&core, &data_from(&core, Role::Client, "hello"));
        core.on_frame(mac(1), &hello, false, 10);
        core.tick(10_000);

        assert_eq!(
            *data.lock().unwrap(),
            vec![(0, mac(1), "hello".to_string()), (1, mac(1), "hello".to_string())]
        );
        assert_eq!(
            *peers.lock().unwrap(),
            vec![
                (0, mac(1), true),
                (1, mac(1), true),
                (0, mac(1), false),
                (1, mac(1), false)
            ]
        );
    }

    #[test]
    fn first_tick_advertises_on_broadcast() {
        let mut core = running(Role::Client);
        let report = core.tick(0);
        assert!(report.advertised);
        let sent = core.transport_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MacAddr::BROADCAST);
        let msg = MessageCodec::default().decode(&sent[0].1).unwrap();
        assert_eq!(msg.command, Command::Register);
        assert_eq!(msg.group_id, core.config().adv_group_id);

        assert!(!core.tick(500).advertised);
        assert!(core.tick(1000).advertised);
    }

    #[test]
    fn registration_emits_connected_event() {
        let mut core = running(Role::Server);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        core.add_peer_handler(move |e| sink.lock().unwrap().push(e));

        let reg = register_from(&core, Role::Client);
        assert!(matches!(
            core.on_frame(mac(1), &reg, true, 10),
            Inbound::Registration(Admission::Admitted(_))
        ));
        assert!(matches!(
            core.on_frame(mac(1), &reg, true, 20),
            Inbound::Registration(Admission::AlreadyRegistered)
        ));
        assert_eq!(core.total_peer_count(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec![PeerEvent {
                mac: mac(1),
                role: Role::Client,
                connected: true
            }]
        );
        assert_eq!(core.last_seen_age(&mac(1), 100), Some(90));
    }

    #[test]
    fn data_forwarded_and_refreshes_liveness() {
        let mut core = running(Role::Client);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        core.add_data_handler(move |src, msg, broadcast| {
            sink.lock().unwrap().push((src, msg.payload_text(), broadcast))
        });

        let reg = register_from(&core, Role::Server);
        core.on_frame(mac(1), &reg, true, 0);

        let data = frame(&core, &data_from(&core, Role::Server, "hello"));
        assert!(matches!(core.on_frame(mac(1), &data, false, 300), Inbound::Delivered));
        let mut other = data_from(&core, Role::Server, "custom");
        other.command = Command::Other(42);
        let other = frame(&core, &other);
        assert!(matches!(core.on_frame(mac(1), &other, true, 400), Inbound::Delivered));

        assert_eq!(
            *received.lock().unwrap(),
            vec![
                (mac(1), "hello".to_string(), false),
                (mac(1), "custom".to_string(), true)
            ]
        );
        assert_eq!(core.last_seen_age(&mac(1), 400), Some(0));
    }

    #[test]
    fn rejected_frames_leave_state_alone() {
        let mut core = running(Role::Server);
        let reg = register_from(&core, Role::Client);
        core.on_frame(mac(1), &reg, true, 0);

        let mut wrong_group = data_from(&core, Role::Client, "x");
        wrong_group.group_id = core.config().adv_group_id.clone();
        let wrong_group = frame(&core, &wrong_group);
        assert!(matches!(
            core.on_frame(mac(1), &wrong_group, false, 100),
            Inbound::Dropped(Rejection::GroupMismatch)
        ));

        let mut wrong_mode = data_from(&core, Role::Client, "x");
        wrong_mode.secure = true;
        let wrong_mode = frame(&core, &wrong_mode);
        assert!(matches!(
            core.on_frame(mac(1), &wrong_mode, false, 100),
            Inbound::Dropped(Rejection::SecurityMismatch)
        ));

        let stranger = frame(&core, &data_from(&core, Role::Client, "x"));
        assert!(matches!(
            core.on_frame(mac(9), &stranger, false, 100),
            Inbound::Dropped(Rejection::UnknownPeer)
        ));

        assert!(matches!(
            core.on_frame(mac(1), &[1, 2, 3], false, 100),
            Inbound::Malformed(FormatError::Truncated { .. })
        ));
        assert_eq!(core.last_seen_age(&mac(1), 100), Some(100));
    }

    #[test]
    fn own_frames_ignored() {
        let mut core = running(Role::Server);
        let reg = register_from(&core, Role::Client);
        assert!(matches!(core.on_frame(LOCAL, &reg, true, 0), Inbound::Ignored));
        assert_eq!(core.total_peer_count(), 0);
    }

    #[test]
    fn role_filter_drops_client_traffic_on_clients() {
        let mut core = running(Role::Client);
        let reg = register_from(&core, Role::Server);
        core.on_frame(mac(1), &reg, true, 0);

        // A server that changed role after admission now speaks as a client.
        let from_client = frame(&core, &data_from(&core, Role::Client, "x"));
        assert!(matches!(
            core.on_frame(mac(1), &from_client, false, 10),
            Inbound::Delivered
        ));
        core.set_role_filter(true).unwrap();
        assert!(matches!(
            core.on_frame(mac(1), &from_client, false, 20),
            Inbound::Dropped(Rejection::RoleFiltered)
        ));
        let from_server = frame(&core, &data_from(&core, Role::Server, "x"));
        assert!(matches!(
            core.on_frame(mac(1), &from_server, false, 30),
            Inbound::Delivered
        ));
    }

    #[test]
    fn queued_frames_dispatch_inside_tick() {
        let mut core = running(Role::Server);
        let sink = core.frame_sink();
        let reg = register_from(&core, Role::Client);
        let handle = std::thread::spawn(move || {
            assert!(sink.deliver(mac(1), &reg, true));
            assert!(sink.deliver(mac(2), &reg, true));
        });
        handle.join().unwrap();
        assert_eq!(core.total_peer_count(), 0);

        let report = core.tick(50);
        assert_eq!(report.inbound, 2);
        assert_eq!(core.total_peer_count(), 2);
        assert_eq!(core.last_seen_age(&mac(2), 50), Some(0));
    }

    #[test]
    fn heartbeat_keeps_peer_alive() {
        let mut core = running(Role::Server);
        let reg = register_from(&core, Role::Client);
        core.on_frame(mac(1), &reg, true, 0);

        let mut hb = data_from(&core, Role::Client, "");
        hb.command = Command::Heartbeat;
        let hb = frame(&core, &hb);
        for t in (1000..=10_000).step_by(1000) {
            assert!(matches!(core.on_frame(mac(1), &hb, false, t), Inbound::Heartbeat));
            assert!(core.tick(t).evicted.is_empty());
        }
        assert!(core.tick(15_000).evicted.is_empty());
        assert_eq!(core.tick(15_001).evicted.len(), 1);
        assert_eq!(core.total_peer_count(), 0);
    }

    #[test]
    fn heartbeat_round_reaches_every_peer() {
        let mut core = running(Role::Server);
        let reg = register_from(&core, Role::Client);
        core.on_frame(mac(1), &reg, true, 0);
        core.on_frame(mac(2), &reg, true, 0);
        let report = core.tick(0);
        assert_eq!(report.heartbeats.unwrap().sent, 2);
        assert!(core.tick(999).heartbeats.is_none());
        assert!(core.tick(1000).heartbeats.is_some());
    }

    #[test]
    fn shutdown_releases_in_order() {
        let mut core = running(Role::Server);
        let reg = register_from(&core, Role::Client);
        core.on_frame(mac(1), &reg, true, 0);
        let events = Arc::new(Mutex::new(0));
        let count = events.clone();
        core.add_peer_handler(move |_| *count.lock().unwrap() += 1);

        core.shutdown().unwrap();
        assert_eq!(core.state(), NodeState::Stopped);
        assert!(!core.transport().is_running());
        assert_eq!(core.total_peer_count(), 0);
        assert_eq!(*events.lock().unwrap(), 0);
        let ops = core.transport().ops();
        assert_eq!(
            &ops[ops.len() - 3..],
            &[
                TransportOp::Unregister(MacAddr::BROADCAST),
                TransportOp::Unregister(mac(1)),
                TransportOp::Stop
            ]
        );

        assert!(matches!(core.shutdown(), Err(CoreError::InvalidState { .. })));
        assert!(matches!(core.begin(), Err(CoreError::InvalidState { .. })));
        assert!(core.set_channel(1).is_err());
        assert!(core.send_to_all(b"x").is_err());
        assert!(core.tick(10).evicted.is_empty());
    }

    #[test]
    fn send_requires_running_and_fitting_payload() {
        let mut core = ProtocolCore::new(ProtocolConfig::default(), MemoryTransport::new(LOCAL));
        assert!(matches!(
            core.send_to_all(b"x"),
            Err(CoreError::InvalidState { .. })
        ));
        core.begin().unwrap();
        assert!(core.send_to_all(b"nobody home").unwrap());
        let too_big = vec![0u8; core.payload_capacity() + 1];
        assert!(matches!(
            core.send_to_all(&too_big),
            Err(CoreError::Format(FormatError::PayloadTooLarge { .. }))
        ));
        assert!(core.send_broadcast(b"hi").unwrap());
    }

    #[test]
    fn channel_change_reaches_transport_when_running() {
        let mut core = ProtocolCore::new(ProtocolConfig::default(), MemoryTransport::new(LOCAL));
        core.set_channel(6).unwrap();
        assert!(core.transport().ops().is_empty());
        core.begin().unwrap();
        core.set_channel(11).unwrap();
        assert_eq!(core.transport().ops().last(), Some(&TransportOp::SetChannel(11)));
        assert_eq!(core.config().channel, 11);
    }

    #[test]
    fn status_snapshot() {
        let mut core = running(Role::Server);
        let reg = register_from(&core, Role::Client);
        core.on_frame(mac(2), &reg, true, 100);
        let reg = register_from(&core, Role::Server);
        core.on_frame(mac(1), &reg, true, 200);

        let status = core.status(1200);
        assert_eq!(status.server_peers, 1);
        assert_eq!(status.client_peers, 1);
        assert_eq!(
            status.peers,
            vec![
                PeerStatus {
                    mac: mac(1),
                    role: Role::Server,
                    age_ms: 1000
                },
                PeerStatus {
                    mac: mac(2),
                    role: Role::Client,
                    age_ms: 1100
                }
            ]
        );
        let text = status.to_string();
        assert!(text.starts_with("SERVER running"));
        assert!(text.contains("peer 1: 02:00:00:00:00:02 [CLIENT] last seen 1100 ms ago"));
        assert_eq!(core.message_size(), 1041);
    }
}
