//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Network configuration shared by the session, advertiser, and browser.
/// File: ~/.config/huddle/config.toml or /etc/huddle/config.toml.
/// Env overrides: HUDDLE_ANNOUNCE_ADDR, HUDDLE_ANNOUNCE_PORT,
/// HUDDLE_INVITE_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Announce destination address (default multicast 239.255.70.70).
    /// A unicast address also works; browsers then skip group membership,
    /// which is what the loopback tests rely on.
    #[serde(default = "default_announce_addr")]
    pub announce_addr: String,
    /// UDP port announces are sent to and browsed on (default 53530). All
    /// services share it; frames carry the service name.
    #[serde(default = "default_announce_port")]
    pub announce_port: u16,
    /// Seconds between announces (default 4).
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
    /// Seconds of announce silence before a browsed peer is dropped
    /// (default 16).
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// TCP port the advertiser accepts invitations on (default 0 =
    /// ephemeral; the actual port travels in the announce).
    #[serde(default)]
    pub invite_port: u16,
}

fn default_announce_addr() -> String {
    "239.255.70.70".to_string()
}
fn default_announce_port() -> u16 {
    53530
}
fn default_announce_interval_secs() -> u64 {
    4
}
fn default_peer_timeout_secs() -> u64 {
    16
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            announce_addr: default_announce_addr(),
            announce_port: default_announce_port(),
            announce_interval_secs: default_announce_interval_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            invite_port: 0,
        }
    }
}

impl NetConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }

    /// Destination for outgoing announces.
    pub fn announce_target(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.announce_addr, self.announce_port)
            .parse()
            .map_err(|_| ConfigError::BadAddress(self.announce_addr.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bad announce address: {0}")]
    BadAddress(String),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> NetConfig {
    let mut c = load_default_file().unwrap_or_default();
    apply_env(&mut c);
    c
}

/// Load config from an explicit file, then env vars. Unlike [`load`], a
/// missing or malformed file is an error here.
pub fn load_from(path: &Path) -> Result<NetConfig, ConfigError> {
    let s = std::fs::read_to_string(path)?;
    let mut c: NetConfig = toml::from_str(&s)?;
    apply_env(&mut c);
    Ok(c)
}

fn apply_env(c: &mut NetConfig) {
    if let Ok(s) = std::env::var("HUDDLE_ANNOUNCE_ADDR") {
        if !s.is_empty() {
            c.announce_addr = s;
        }
    }
    if let Ok(s) = std::env::var("HUDDLE_ANNOUNCE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.announce_port = p;
        }
    }
    if let Ok(s) = std::env::var("HUDDLE_INVITE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.invite_port = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/huddle/config.toml"));
    }
    out.push(PathBuf::from("/etc/huddle/config.toml"));
    out
}

fn load_default_file() -> Option<NetConfig> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<NetConfig>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = NetConfig::default();
        assert_eq!(c.announce_port, 53530);
        assert_eq!(c.invite_port, 0);
        assert!(c.announce_target().unwrap().ip().is_multicast());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let c: NetConfig = toml::from_str("announce_port = 60001").unwrap();
        assert_eq!(c.announce_port, 60001);
        assert_eq!(c.announce_addr, "239.255.70.70");
        assert_eq!(c.peer_timeout_secs, 16);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<NetConfig>("beacon_port = 1").is_err());
    }

    #[test]
    fn unicast_target_parses() {
        let c = NetConfig {
            announce_addr: "127.0.0.1".into(),
            ..NetConfig::default()
        };
        assert!(!c.announce_target().unwrap().ip().is_multicast());
    }
}
