//! Seam to the wireless datagram transport. The core never touches the radio directly.

use crate::identity::{MacAddr, SecretKey};

/// Point-to-point datagram service the protocol runs on.
///
/// Implementations own channel selection, power, payload encryption and the
/// radio-level peer objects. Inbound frames are pushed to the core through a
/// [`FrameSink`](crate::FrameSink), from whatever context the radio delivers them in.
pub trait Transport {
    /// Per-peer handle owned by the transport; the core only stores it.
    type Handle: Clone + std::fmt::Debug;

    /// Bring the transport up. `network_key` is set when security is enabled.
    fn start(&mut self, network_key: Option<&SecretKey>) -> Result<(), TransportError>;

    /// Release the transport. Called once, after every handle was released.
    fn stop(&mut self);

    /// Hardware address of this node.
    fn local_mac(&self) -> MacAddr;

    /// Register a peer (or [`MacAddr::BROADCAST`]) and return a handle for sends.
    fn register_peer(
        &mut self,
        mac: MacAddr,
        channel: u8,
        link_key: Option<&SecretKey>,
    ) -> Result<Self::Handle, TransportError>;

    fn unregister_peer(&mut self, handle: Self::Handle);

    /// Fire-and-forget send. Returns false if the frame could not be queued.
    fn send(&mut self, handle: &Self::Handle, frame: &[u8]) -> bool;

    /// Retune the radio. Default: channel is informational only.
    fn set_channel(&mut self, _channel: u8) {}
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("peer table full")]
    PeerTableFull,
    #[error("peer {0} rejected by transport")]
    PeerRejected(MacAddr),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
