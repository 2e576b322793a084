//! Discovery: broadcast advertisements and REGISTER admission.

use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::identity::{MacAddr, SecretKey};
use crate::protocol::{Command, ProtocolMessage, Role};
use crate::registry::{PeerInfo, PeerRecord, PeerRegistry};
use crate::transport::{Transport, TransportError};
use crate::wire::MessageCodec;

/// Why an inbound message was dropped. Never surfaced as an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("group id mismatch")]
    GroupMismatch,
    #[error("security mode mismatch")]
    SecurityMismatch,
    #[error("clients only register with servers")]
    RoleGate,
    #[error("sender is not a registered peer")]
    UnknownPeer,
    #[error("client traffic dropped by role filter")]
    RoleFiltered,
}

/// Transport refused a handle for a peer that passed admission. Non-fatal.
#[derive(Debug, thiserror::Error)]
#[error("failed to add peer {mac}: {source}")]
pub struct AdmissionFailure {
    pub mac: MacAddr,
    #[source]
    pub source: TransportError,
}

/// Result of running admission on one REGISTER.
#[derive(Debug)]
pub enum Admission {
    Admitted(PeerInfo),
    /// Sender already has a record; nothing changed.
    AlreadyRegistered,
    Rejected(Rejection),
    Failed(AdmissionFailure),
}

/// REGISTER advertisement for the broadcast handle.
pub fn advertisement(
    codec: &MessageCodec,
    config: &ProtocolConfig,
    local_mac: MacAddr,
) -> ProtocolMessage {
    let mut msg = codec.message(
        config.adv_group_id.clone(),
        config.role,
        config.channel,
        config.secure,
        Command::Register,
    );
    msg.set_text(&format!(
        "Register request from {} MAC: {}",
        config.role, local_mac
    ));
    msg
}

/// Admission rules without side effects: group, security, duplicate, role gate.
pub fn check<H>(
    config: &ProtocolConfig,
    registry: &PeerRegistry<H>,
    mac: &MacAddr,
    msg: &ProtocolMessage,
) -> Result<(), Admission> {
    if msg.group_id != config.adv_group_id {
        return Err(Admission::Rejected(Rejection::GroupMismatch));
    }
    // Nodes in different security modes never interconnect.
    if msg.secure != config.secure {
        return Err(Admission::Rejected(Rejection::SecurityMismatch));
    }
    if registry.contains(mac) {
        return Err(Admission::AlreadyRegistered);
    }
    if config.role == Role::Client && msg.role != Role::Server {
        return Err(Admission::Rejected(Rejection::RoleGate));
    }
    Ok(())
}

/// Run admission for a REGISTER from `mac` and, if it passes, register the
/// peer with the transport and the registry.
pub fn admit<T: Transport>(
    config: &ProtocolConfig,
    link_key: Option<&SecretKey>,
    registry: &mut PeerRegistry<T::Handle>,
    transport: &mut T,
    mac: MacAddr,
    msg: &ProtocolMessage,
    now_ms: u64,
) -> Admission {
    if let Err(outcome) = check(config, registry, &mac, msg) {
        if let Admission::Rejected(reason) = &outcome {
            debug!(%mac, %reason, "registration ignored");
        }
        return outcome;
    }
    let handle = match transport.register_peer(mac, config.channel, link_key) {
        Ok(h) => h,
        Err(source) => {
            let failure = AdmissionFailure { mac, source };
            warn!("{failure}");
            return Admission::Failed(failure);
        }
    };
    let record = PeerRecord::new(mac, msg.role, msg.secure, now_ms, handle);
    let info = PeerInfo::from(&record);
    if let Err(record) = registry.insert(record) {
        // Unreachable after check(); release the handle.
        transport.unregister_peer(record.into_handle());
        return Admission::AlreadyRegistered;
    }
    info!(%mac, role = %msg.role, "peer registered");
    Admission::Admitted(info)
}
