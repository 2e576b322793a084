//! In-memory transport for host-side tests and simulations.
//!
//! Records every call, keeps sent frames for inspection, and can be told to
//! fail starts, refuse peers or drop sends to specific addresses.

use std::collections::{HashMap, HashSet};

use crate::identity::{MacAddr, SecretKey};
use crate::transport::{Transport, TransportError};

/// Transport calls in the order they happened.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportOp {
    Start { secure: bool },
    Stop,
    Register(MacAddr),
    Unregister(MacAddr),
    SetChannel(u8),
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    local: MacAddr,
    running: bool,
    fail_start: bool,
    peers: HashMap<MacAddr, Option<SecretKey>>,
    refused: HashSet<MacAddr>,
    failing: HashSet<MacAddr>,
    sent: Vec<(MacAddr, Vec<u8>)>,
    ops: Vec<TransportOp>,
}

impl MemoryTransport {
    pub fn new(local: MacAddr) -> Self {
        Self {
            local,
            ..Self::default()
        }
    }

    /// Make the next `start` fail.
    pub fn fail_start(&mut self) {
        self.fail_start = true;
    }

    /// Refuse to register `mac`.
    pub fn refuse_peer(&mut self, mac: MacAddr) {
        self.refused.insert(mac);
    }

    /// Report failure for every send to `mac` until [`heal`](Self::heal).
    pub fn fail_sends_to(&mut self, mac: MacAddr) {
        self.failing.insert(mac);
    }

    pub fn heal(&mut self, mac: MacAddr) {
        self.failing.remove(&mac);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Registered peers, the broadcast address included.
    pub fn registered_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_registered(&self, mac: MacAddr) -> bool {
        self.peers.contains_key(&mac)
    }

    pub fn link_key_of(&self, mac: MacAddr) -> Option<SecretKey> {
        self.peers.get(&mac).cloned().flatten()
    }

    /// Frames successfully sent since the last call, with their destination.
    pub fn take_sent(&mut self) -> Vec<(MacAddr, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    pub fn ops(&self) -> &[TransportOp] {
        &self.ops
    }
}

impl Transport for MemoryTransport {
    type Handle = MacAddr;

    fn start(&mut self, network_key: Option<&SecretKey>) -> Result<(), TransportError> {
        if std::mem::take(&mut self.fail_start) {
            return Err(TransportError::Unavailable("radio did not start".into()));
        }
        self.running = true;
        self.ops.push(TransportOp::Start {
            secure: network_key.is_some(),
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.ops.push(TransportOp::Stop);
    }

    fn local_mac(&self) -> MacAddr {
        self.local
    }

    fn register_peer(
        &mut self,
        mac: MacAddr,
        _channel: u8,
        link_key: Option<&SecretKey>,
    ) -> Result<MacAddr, TransportError> {
        if !self.running {
            return Err(TransportError::Unavailable("not started".into()));
        }
        if self.refused.contains(&mac) {
            return Err(TransportError::PeerRejected(mac));
        }
        self.peers.insert(mac, link_key.cloned());
        self.ops.push(TransportOp::Register(mac));
        Ok(mac)
    }

    fn unregister_peer(&mut self, handle: MacAddr) {
        self.peers.remove(&handle);
        self.ops.push(TransportOp::Unregister(handle));
    }

    fn send(&mut self, handle: &MacAddr, frame: &[u8]) -> bool {
        if !self.running || !self.peers.contains_key(handle) || self.failing.contains(handle) {
            return false;
        }
        self.sent.push((*handle, frame.to_vec()));
        true
    }

    fn set_channel(&mut self, channel: u8) {
        self.ops.push(TransportOp::SetChannel(channel));
    }
}
