//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use adhoc_core::{MacAddr, ProtocolConfig, Role};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/adhoc/config.toml or /etc/adhoc/config.toml.
/// Env overrides: ADHOC_ROLE, ADHOC_CHANNEL, ADHOC_PORT, ADHOC_NETWORK_KEY, ADHOC_LINK_KEY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port shared by every node on the segment (default 47474).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where frames are sent (default 255.255.255.255).
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: Ipv4Addr,
    /// Emulated hardware address; random when unset.
    #[serde(default)]
    pub mac: Option<MacAddr>,
    /// Core tick period (default 50 ms).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Status log period (default 5000 ms).
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Send a DATA greeting to the opposite role this often. Off when unset.
    #[serde(default)]
    pub greeting_interval_ms: Option<u64>,
    #[serde(default)]
    pub node: ProtocolConfig,
}

fn default_port() -> u16 {
    47474
}
fn default_broadcast_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_tick_ms() -> u64 {
    50
}
fn default_status_interval_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            broadcast_addr: default_broadcast_addr(),
            mac: None,
            tick_ms: default_tick_ms(),
            status_interval_ms: default_status_interval_ms(),
            greeting_interval_ms: None,
            node: ProtocolConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{var}: invalid value {value:?}")]
    Env { var: &'static str, value: String },
}

/// Load config: merge default, then config file, then env vars. An explicit
/// `path` must exist; otherwise the first existing default path is used.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match path {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/adhoc/config.toml"));
    }
    out.push(PathBuf::from("/etc/adhoc/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    if let Some(s) = var("ADHOC_ROLE") {
        c.node.role = match s.to_ascii_lowercase().as_str() {
            "server" => Role::Server,
            "client" => Role::Client,
            _ => return Err(ConfigError::Env { var: "ADHOC_ROLE", value: s }),
        };
    }
    if let Some(s) = var("ADHOC_CHANNEL") {
        c.node.channel = s.parse().map_err(|_| ConfigError::Env {
            var: "ADHOC_CHANNEL",
            value: s.clone(),
        })?;
    }
    if let Some(s) = var("ADHOC_PORT") {
        c.port = s.parse().map_err(|_| ConfigError::Env {
            var: "ADHOC_PORT",
            value: s.clone(),
        })?;
    }
    if let Some(s) = var("ADHOC_NETWORK_KEY") {
        c.node.network_key = Some(s);
    }
    if let Some(s) = var("ADHOC_LINK_KEY") {
        c.node.link_key = Some(s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 50000
mac = "02:00:00:00:00:01"
greeting_interval_ms = 2000

[node]
role = "server"
secure = true
network_key = "pmk"
link_key = "lmk"
"#
        )
        .unwrap();
        let c = load_file(f.path()).unwrap();
        assert_eq!(c.port, 50000);
        assert_eq!(c.mac, Some("02:00:00:00:00:01".parse().unwrap()));
        assert_eq!(c.greeting_interval_ms, Some(2000));
        assert_eq!(c.tick_ms, 50);
        assert_eq!(c.node.role, Role::Server);
        assert!(c.node.security_keys().unwrap().is_some());
        assert_eq!(c.node.channel, 4);
    }

    #[test]
    fn bad_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(load(Some(&missing)), Err(ConfigError::Read { .. })));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "port = \"high\"\n").unwrap();
        assert!(matches!(load_file(&bad), Err(ConfigError::Parse { .. })));

        std::fs::write(&bad, "[node]\nrole = \"router\"\n").unwrap();
        assert!(matches!(load_file(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        apply_env(
            &mut c,
            env(&[
                ("ADHOC_ROLE", "SERVER"),
                ("ADHOC_CHANNEL", "11"),
                ("ADHOC_PORT", "40000"),
                ("ADHOC_LINK_KEY", "lmk"),
            ]),
        )
        .unwrap();
        assert_eq!(c.node.role, Role::Server);
        assert_eq!(c.node.channel, 11);
        assert_eq!(c.port, 40000);
        assert_eq!(c.node.link_key.as_deref(), Some("lmk"));
        assert!(c.node.network_key.is_none());

        let err = apply_env(&mut c, env(&[("ADHOC_CHANNEL", "eleven")])).unwrap_err();
        assert!(err.to_string().starts_with("ADHOC_CHANNEL"));
    }
}
