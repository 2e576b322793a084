//! Protocol configuration. Serializable so hosts can load it from a file.

use serde::{Deserialize, Serialize};

use crate::identity::{GroupId, SecretKey};
use crate::protocol::{
    Role, DEFAULT_ADVERTISE_INTERVAL_MS, DEFAULT_ADV_GROUP_ID, DEFAULT_CHANNEL, DEFAULT_GROUP_ID,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_PAYLOAD_LEN,
};

/// Node configuration. Keys are passphrases of at most 16 bytes; both are
/// required when `secure` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default = "default_channel")]
    pub channel: u8,
    #[serde(default = "default_adv_group_id")]
    pub adv_group_id: GroupId,
    #[serde(default = "default_group_id")]
    pub group_id: GroupId,
    #[serde(default = "default_advertise_interval_ms")]
    pub advertise_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub network_key: Option<String>,
    #[serde(default)]
    pub link_key: Option<String>,
    #[serde(default = "default_payload_len")]
    pub payload_len: usize,
    /// Clients drop everything but REGISTER from other clients when set.
    #[serde(default)]
    pub role_filter: bool,
}

fn default_role() -> Role {
    Role::Client
}
fn default_channel() -> u8 {
    DEFAULT_CHANNEL
}
fn default_adv_group_id() -> GroupId {
    GroupId::new(DEFAULT_ADV_GROUP_ID).expect("default group id fits")
}
fn default_group_id() -> GroupId {
    GroupId::new(DEFAULT_GROUP_ID).expect("default group id fits")
}
fn default_advertise_interval_ms() -> u64 {
    DEFAULT_ADVERTISE_INTERVAL_MS
}
fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_heartbeat_timeout_ms() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}
fn default_payload_len() -> usize {
    DEFAULT_PAYLOAD_LEN
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            channel: default_channel(),
            adv_group_id: default_adv_group_id(),
            group_id: default_group_id(),
            advertise_interval_ms: default_advertise_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            secure: false,
            network_key: None,
            link_key: None,
            payload_len: default_payload_len(),
            role_filter: false,
        }
    }
}

/// Keys resolved for a secured node.
#[derive(Debug, Clone)]
pub struct SecurityKeys {
    pub network: SecretKey,
    pub link: SecretKey,
}

impl ProtocolConfig {
    pub fn with_role(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Resolve keys. `Ok(None)` when security is off; an error describes what is
    /// missing or malformed when it is on.
    pub fn security_keys(&self) -> Result<Option<SecurityKeys>, String> {
        if !self.secure {
            return Ok(None);
        }
        let (Some(network), Some(link)) = (&self.network_key, &self.link_key) else {
            return Err("security mode requires both a network key and a link key".into());
        };
        let network =
            SecretKey::from_passphrase(network).map_err(|e| format!("network key: {e}"))?;
        let link = SecretKey::from_passphrase(link).map_err(|e| format!("link key: {e}"))?;
        Ok(Some(SecurityKeys { network, link }))
    }
}
