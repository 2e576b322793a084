//! Liveness: heartbeat fan-out, timeout eviction and the interval timers driving them.

use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::identity::MacAddr;
use crate::protocol::{Command, ProtocolMessage, Role};
use crate::registry::{PeerInfo, PeerRegistry};
use crate::transport::Transport;
use crate::wire::MessageCodec;

/// Fires when at least `interval` ms passed since it last fired. A fresh or
/// reset timer fires on the next poll.
#[derive(Debug, Clone, Copy)]
pub struct IntervalTimer {
    interval: u64,
    last: Option<u64>,
}

impl IntervalTimer {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: interval_ms,
            last: None,
        }
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.interval = interval_ms;
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// True (and re-arms) if the timer is due at `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval,
        };
        if due {
            self.last = Some(now_ms);
        }
        due
    }
}

/// Outcome of one heartbeat round. Failed peers stay registered.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct FanOutReport {
    pub sent: usize,
    pub failed: Vec<MacAddr>,
}

impl FanOutReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// HEARTBEAT stamped with the operational group, addressed (in text) to a peer role.
pub fn heartbeat(codec: &MessageCodec, config: &ProtocolConfig, to: Role) -> ProtocolMessage {
    let mut msg = codec.message(
        config.group_id.clone(),
        config.role,
        config.channel,
        config.secure,
        Command::Heartbeat,
    );
    msg.set_text(&format!("Heartbeat from {} to {}", config.role, to));
    msg
}

/// Send one heartbeat to every registered peer. A failed send never aborts
/// the round or removes the peer.
pub fn send_heartbeats<T: Transport>(
    codec: &MessageCodec,
    config: &ProtocolConfig,
    registry: &PeerRegistry<T::Handle>,
    transport: &mut T,
) -> FanOutReport {
    let mut report = FanOutReport::default();
    // At most two distinct frames: one per peer role.
    let mut frames: [Option<Vec<u8>>; 2] = [None, None];
    for peer in registry.iter() {
        let slot = &mut frames[peer.role().is_server() as usize];
        if slot.is_none() {
            match codec.encode(&heartbeat(codec, config, peer.role())) {
                Ok(frame) => *slot = Some(frame),
                Err(e) => {
                    warn!("heartbeat encode failed: {e}");
                    return report;
                }
            }
        }
        let Some(frame) = slot.as_deref() else {
            continue;
        };
        if transport.send(peer.handle(), frame) {
            debug!(mac = %peer.mac(), "heartbeat sent");
            report.sent += 1;
        } else {
            warn!(mac = %peer.mac(), "heartbeat send failed");
            report.failed.push(peer.mac());
        }
    }
    report
}

/// Evict peers silent for longer than the heartbeat timeout: release their
/// transport handle and drop the record. Returns who was evicted.
pub fn sweep<T: Transport>(
    registry: &mut PeerRegistry<T::Handle>,
    transport: &mut T,
    now_ms: u64,
    timeout_ms: u64,
) -> Vec<PeerInfo> {
    registry
        .remove_expired(now_ms, timeout_ms)
        .into_iter()
        .map(|record| {
            let info = PeerInfo::from(&record);
            info!(mac = %info.mac, role = %info.role, age_ms = record.age(now_ms), "peer timeout");
            transport.unregister_peer(record.into_handle());
            info
        })
        .collect()
}
