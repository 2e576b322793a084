//! Peer registry: one record per MAC, owned here, keyed by address.

use std::collections::HashMap;

use crate::identity::MacAddr;
use crate::protocol::Role;

/// Admitted peer. Only `last_seen` changes after admission.
#[derive(Debug, Clone)]
pub struct PeerRecord<H> {
    mac: MacAddr,
    role: Role,
    secure: bool,
    last_seen: u64,
    handle: H,
}

impl<H> PeerRecord<H> {
    pub fn new(mac: MacAddr, role: Role, secure: bool, now_ms: u64, handle: H) -> Self {
        Self {
            mac,
            role,
            secure,
            last_seen: now_ms,
            handle,
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn into_handle(self) -> H {
        self.handle
    }

    /// Milliseconds since the last accepted message (0 if `now_ms` lags behind).
    pub fn age(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen)
    }

    fn touch(&mut self, now_ms: u64) {
        // Monotonic: a late timestamp never moves last_seen backwards.
        self.last_seen = self.last_seen.max(now_ms);
    }
}

/// Lightweight copy of a record, without the transport handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeerInfo {
    pub mac: MacAddr,
    pub role: Role,
    pub secure: bool,
    pub last_seen: u64,
}

impl<H> From<&PeerRecord<H>> for PeerInfo {
    fn from(r: &PeerRecord<H>) -> Self {
        PeerInfo {
            mac: r.mac,
            role: r.role,
            secure: r.secure,
            last_seen: r.last_seen,
        }
    }
}

pub struct PeerRegistry<H> {
    peers: HashMap<MacAddr, PeerRecord<H>>,
}

impl<H> PeerRegistry<H> {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    pub fn contains(&self, mac: &MacAddr) -> bool {
        self.peers.contains_key(mac)
    }

    pub fn get(&self, mac: &MacAddr) -> Option<&PeerRecord<H>> {
        self.peers.get(mac)
    }

    /// Insert a new record. If the MAC is already present the registry is left
    /// unchanged and the rejected record is handed back.
    pub fn insert(&mut self, record: PeerRecord<H>) -> Result<(), PeerRecord<H>> {
        if self.peers.contains_key(&record.mac) {
            return Err(record);
        }
        self.peers.insert(record.mac, record);
        Ok(())
    }

    /// Refresh last-seen for an accepted message. Returns false for unknown peers.
    pub fn touch(&mut self, mac: &MacAddr, now_ms: u64) -> bool {
        match self.peers.get_mut(mac) {
            Some(r) => {
                r.touch(now_ms);
                true
            }
            None => false,
        }
    }

    /// Remove and return every record whose silence exceeds `timeout_ms` (strictly).
    pub fn remove_expired(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<PeerRecord<H>> {
        let expired: Vec<MacAddr> = self
            .peers
            .values()
            .filter(|r| r.age(now_ms) > timeout_ms)
            .map(|r| r.mac)
            .collect();
        expired
            .iter()
            .filter_map(|mac| self.peers.remove(mac))
            .collect()
    }

    /// Empty the registry, returning every record.
    pub fn drain(&mut self) -> Vec<PeerRecord<H>> {
        self.peers.drain().map(|(_, r)| r).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord<H>> {
        self.peers.values()
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &PeerRecord<H>> {
        self.peers.values().filter(move |r| r.role == role)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.with_role(role).count()
    }

    /// Age of a peer's last accepted message, if registered.
    pub fn last_seen_age(&self, mac: &MacAddr, now_ms: u64) -> Option<u64> {
        self.peers.get(mac).map(|r| r.age(now_ms))
    }
}

impl<H> Default for PeerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
