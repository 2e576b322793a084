//! Ad-hoc discovery and liveness protocol for point-to-point wireless datagram radios.
//! Host-driven: no I/O of its own; the host supplies a `Transport`, calls `tick`
//! and feeds inbound frames through a `FrameSink`.

pub mod config;
pub mod core;
pub mod discovery;
pub mod identity;
pub mod liveness;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod wire;

pub use crate::core::{
    CoreError, FrameSink, Inbound, NodeState, NodeStatus, PeerEvent, PeerStatus, ProtocolCore,
    TickReport,
};
pub use config::ProtocolConfig;
pub use discovery::{Admission, AdmissionFailure, Rejection};
pub use identity::{GroupId, MacAddr, SecretKey};
pub use liveness::FanOutReport;
pub use protocol::{Command, ProtocolMessage, Role};
pub use registry::PeerInfo;
pub use transport::{Transport, TransportError};
pub use wire::{FormatError, MessageCodec, HEADER_LEN};
