//! Load configuration from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Default AppleMIDI control port.
pub const DEFAULT_PORT: u16 = 5004;

/// Daemon configuration. File: ~/.config/midilink/config.toml or
/// /etc/midilink/config.toml.
/// Env overrides: MIDILINK_NAME, MIDILINK_PORTS, MIDILINK_CONNECT_TO.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name announced over mDNS and used in session handshakes.
    #[serde(default = "default_name")]
    pub name: String,
    /// Control ports for servers opened at startup (default [5004]).
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    /// Remote endpoints to connect to at startup:
    /// "host", "name:host", or "name:host:port".
    #[serde(default)]
    pub connect_to: Vec<String>,
}

fn default_name() -> String {
    "midilink".to_string()
}
fn default_ports() -> Vec<u16> {
    vec![DEFAULT_PORT]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            ports: default_ports(),
            connect_to: Vec::new(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("MIDILINK_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Ok(s) = std::env::var("MIDILINK_PORTS") {
        let ports: Vec<u16> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
        if !ports.is_empty() {
            c.ports = ports;
        }
    }
    if let Ok(s) = std::env::var("MIDILINK_CONNECT_TO") {
        c.connect_to = s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/midilink/config.toml"));
    }
    out.push(PathBuf::from("/etc/midilink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

/// A parsed connect-to target. Invalid targets are fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid connect target '{0}': format is host, name:host, or name:host:port")]
    InvalidTarget(String),
    #[error("invalid port in connect target '{0}'")]
    InvalidPort(String),
}

impl ConnectTarget {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [host] if !host.is_empty() => Ok(Self {
                name: host.to_string(),
                host: host.to_string(),
                port: DEFAULT_PORT,
            }),
            [name, host] if !name.is_empty() && !host.is_empty() => Ok(Self {
                name: name.to_string(),
                host: host.to_string(),
                port: DEFAULT_PORT,
            }),
            [name, host, port] if !name.is_empty() && !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidPort(spec.to_string()))?;
                Ok(Self {
                    name: name.to_string(),
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(ConfigError::InvalidTarget(spec.to_string())),
        }
    }
}
