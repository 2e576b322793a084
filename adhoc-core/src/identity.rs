//! Node identity: hardware address, group identifiers and shared keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum group id length in bytes (a hyphenated UUID), excluding the terminator.
pub const GROUP_ID_MAX_LEN: usize = 36;

/// Group id field width on the wire: text plus NUL terminator.
pub const GROUP_ID_FIELD_LEN: usize = GROUP_ID_MAX_LEN + 1;

/// Shared key length accepted by the radio (network and link keys).
pub const KEY_LEN: usize = 16;

/// 6-byte hardware (MAC) address. Registry key for peers.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Broadcast destination.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    /// Accepts `AA:BB:CC:DD:EE:FF` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddr(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logical network identifier carried in every message.
///
/// Always at most [`GROUP_ID_MAX_LEN`] bytes with no interior NUL, so the codec
/// can write it with an explicit terminator.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct GroupId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupIdError {
    #[error("group id is {0} bytes, limit is {GROUP_ID_MAX_LEN}")]
    TooLong(usize),
    #[error("group id contains a NUL byte")]
    InteriorNul,
}

impl GroupId {
    pub fn new(id: impl Into<String>) -> Result<Self, GroupIdError> {
        let id = id.into();
        if id.len() > GROUP_ID_MAX_LEN {
            return Err(GroupIdError::TooLong(id.len()));
        }
        if id.as_bytes().contains(&0) {
            return Err(GroupIdError::InteriorNul);
        }
        Ok(GroupId(id))
    }

    /// Fresh random group id, for provisioning a new network.
    pub fn random() -> Self {
        GroupId::from(uuid::Uuid::new_v4())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<uuid::Uuid> for GroupId {
    fn from(id: uuid::Uuid) -> Self {
        // Hyphenated UUIDs are exactly 36 ASCII bytes.
        GroupId(id.hyphenated().to_string())
    }
}

impl FromStr for GroupId {
    type Err = GroupIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GroupId::new(s)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for GroupId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for GroupId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        GroupId::new(s).map_err(serde::de::Error::custom)
    }
}

/// Opaque shared key handed to the transport (network-wide or per link).
/// The core never interprets it.
#[derive(Clone, Eq, PartialEq)]
pub struct SecretKey([u8; KEY_LEN]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("key is {0} bytes, limit is {KEY_LEN}")]
pub struct KeyTooLong(pub usize);

impl SecretKey {
    /// Key from a passphrase of at most [`KEY_LEN`] bytes, zero padded.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, KeyTooLong> {
        let raw = passphrase.as_bytes();
        if raw.len() > KEY_LEN {
            return Err(KeyTooLong(raw.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key[..raw.len()].copy_from_slice(raw);
        Ok(SecretKey(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}
