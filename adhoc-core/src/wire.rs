//! Fixed-layout framing. Every frame is `HEADER_LEN + payload capacity` bytes.
//!
//! ```text
//! +-----------+------+---------+--------+---------+-----------------+
//! | group_id  | role | channel | secure | command | payload         |
//! |   37B     |  1B  |   1B    |   1B   |   1B    | capacity bytes  |
//! +-----------+------+---------+--------+---------+-----------------+
//! ```

use crate::identity::{GroupId, GROUP_ID_FIELD_LEN};
use crate::protocol::{Command, ProtocolMessage, Role, DEFAULT_PAYLOAD_LEN};

/// Header size: group id field plus four single-byte fields.
pub const HEADER_LEN: usize = GROUP_ID_FIELD_LEN + 4;

const ROLE_AT: usize = GROUP_ID_FIELD_LEN;
const CHANNEL_AT: usize = ROLE_AT + 1;
const SECURE_AT: usize = CHANNEL_AT + 1;
const COMMAND_AT: usize = SECURE_AT + 1;

/// Encoder/decoder for one payload capacity. All nodes of a network must agree on it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageCodec {
    payload_len: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_LEN)
    }
}

impl MessageCodec {
    pub const fn new(payload_len: usize) -> Self {
        Self { payload_len }
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Size of every encoded frame.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }

    /// Empty message sized for this codec.
    pub fn message(
        &self,
        group_id: GroupId,
        role: Role,
        channel: u8,
        secure: bool,
        command: Command,
    ) -> ProtocolMessage {
        ProtocolMessage::new(group_id, role, channel, secure, command, self.payload_len)
    }

    /// Encode into a fresh frame. The payload must be exactly the capacity,
    /// as built by [`message`](Self::message).
    pub fn encode(&self, msg: &ProtocolMessage) -> Result<Vec<u8>, FormatError> {
        let len = msg.payload.len();
        if len > self.payload_len {
            return Err(FormatError::PayloadTooLarge {
                len,
                capacity: self.payload_len,
            });
        }
        if len < self.payload_len {
            return Err(FormatError::PayloadTooShort {
                len,
                capacity: self.payload_len,
            });
        }
        let group = msg.group_id.as_str().as_bytes();
        // GroupId guarantees this; re-checked so the terminator can never be overwritten.
        if group.len() >= GROUP_ID_FIELD_LEN {
            return Err(FormatError::GroupIdTooLong(group.len()));
        }
        let mut out = vec![0u8; self.frame_len()];
        out[..group.len()].copy_from_slice(group);
        out[ROLE_AT] = msg.role.is_server() as u8;
        out[CHANNEL_AT] = msg.channel;
        out[SECURE_AT] = msg.secure as u8;
        out[COMMAND_AT] = msg.command.code();
        out[HEADER_LEN..].copy_from_slice(&msg.payload);
        Ok(out)
    }

    /// Decode one frame. Trailing bytes past the frame length are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, FormatError> {
        if bytes.len() < self.frame_len() {
            return Err(FormatError::Truncated {
                len: bytes.len(),
                expected: self.frame_len(),
            });
        }
        let field = &bytes[..GROUP_ID_FIELD_LEN];
        let end = field
            .iter()
            .position(|&b| b == 0)
            .ok_or(FormatError::UnterminatedGroupId)?;
        let text = std::str::from_utf8(&field[..end]).map_err(|_| FormatError::InvalidGroupId)?;
        let group_id = GroupId::new(text).map_err(|_| FormatError::InvalidGroupId)?;
        Ok(ProtocolMessage {
            group_id,
            role: Role::from_wire(bytes[ROLE_AT] != 0),
            channel: bytes[CHANNEL_AT],
            secure: bytes[SECURE_AT] != 0,
            command: Command::from(bytes[COMMAND_AT]),
            payload: bytes[HEADER_LEN..self.frame_len()].to_vec(),
        })
    }
}

/// Error encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("frame truncated: {len} bytes, expected {expected}")]
    Truncated { len: usize, expected: usize },
    #[error("payload of {len} bytes exceeds capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("payload of {len} bytes is shorter than capacity {capacity}")]
    PayloadTooShort { len: usize, capacity: usize },
    #[error("group id of {0} bytes does not fit its field")]
    GroupIdTooLong(usize),
    #[error("group id field has no terminator")]
    UnterminatedGroupId,
    #[error("group id is not valid text")]
    InvalidGroupId,
}
