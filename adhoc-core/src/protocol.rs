//! Protocol message types, command codes and defaults.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::GroupId;

/// Default payload capacity of a message in bytes.
pub const DEFAULT_PAYLOAD_LEN: usize = 1000;
/// Largest payload capacity a node accepts.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024;

/// Default radio channel.
pub const DEFAULT_CHANNEL: u8 = 4;

/// Group used only for the REGISTER handshake.
pub const DEFAULT_ADV_GROUP_ID: &str = "906b868f-7e9b-4c21-b587-70c8d5fadfee";

/// Group used for all traffic after registration.
pub const DEFAULT_GROUP_ID: &str = "73f8e3bb-aab2-4808-8efe-c061c88e48c2";

pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_ADVERTISE_INTERVAL_MS: u64 = 1000;

/// Node role. Clients register only with servers; servers accept everyone.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn is_server(self) -> bool {
        self == Role::Server
    }

    /// Wire representation: true = SERVER.
    pub fn from_wire(server: bool) -> Self {
        if server {
            Role::Server
        } else {
            Role::Client
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Server => "SERVER",
            Role::Client => "CLIENT",
        })
    }
}

/// Message command. Unknown codes are carried as `Other` and treated like DATA.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Command {
    Register,
    Heartbeat,
    Data,
    Other(u8),
}

impl Command {
    pub const REGISTER: u8 = 1;
    pub const HEARTBEAT: u8 = 2;
    pub const DATA: u8 = 11;

    pub fn code(self) -> u8 {
        match self {
            Command::Register => Self::REGISTER,
            Command::Heartbeat => Self::HEARTBEAT,
            Command::Data => Self::DATA,
            Command::Other(n) => n,
        }
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            Self::REGISTER => Command::Register,
            Self::HEARTBEAT => Command::Heartbeat,
            Self::DATA => Command::Data,
            n => Command::Other(n),
        }
    }
}

/// One protocol message. `payload` always holds exactly the codec's payload
/// capacity once built through [`ProtocolMessage::new`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProtocolMessage {
    pub group_id: GroupId,
    pub role: Role,
    pub channel: u8,
    pub secure: bool,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    /// Message with a zeroed payload of `payload_len` bytes.
    pub fn new(
        group_id: GroupId,
        role: Role,
        channel: u8,
        secure: bool,
        command: Command,
        payload_len: usize,
    ) -> Self {
        Self {
            group_id,
            role,
            channel,
            secure,
            command,
            payload: vec![0; payload_len],
        }
    }

    /// Copy `data` into the payload and zero the rest. Returns false (payload
    /// untouched) if `data` does not fit.
    pub fn set_payload(&mut self, data: &[u8]) -> bool {
        if data.len() > self.payload.len() {
            return false;
        }
        self.payload[..data.len()].copy_from_slice(data);
        self.payload[data.len()..].fill(0);
        true
    }

    /// Write `text` as a NUL-terminated string. Text longer than the payload
    /// allows is cut at a char boundary so the terminator always fits.
    pub fn set_text(&mut self, text: &str) {
        let Some(room) = self.payload.len().checked_sub(1) else {
            return;
        };
        let mut end = text.len().min(room);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        self.payload[..end].copy_from_slice(&text.as_bytes()[..end]);
        self.payload[end..].fill(0);
    }

    /// Payload read as text up to the first NUL (lossy for non-UTF-8 bytes).
    pub fn payload_text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}
