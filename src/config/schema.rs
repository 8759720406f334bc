//! `config.toml` schema for subsync.
//!
//! Every section and field carries a serde default, so a missing file or a
//! partial file always yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub panel: PanelConfig,
    pub engine: EngineConfig,
    pub nodes: NodesConfig,
    pub sync: SyncConfig,
}

/// Panel (subscription API) access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PanelConfig {
    /// Base URL of the panel API, e.g. `https://panel.example.com/api/v1`.
    pub api_base_url: String,
    /// Value sent verbatim in the `Authorization` header.
    pub auth_token: Option<String>,
    /// User-Agent used when downloading engine config text.
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            auth_token: None,
            user_agent: "clash-verge/v2.0".into(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl PanelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Local Clash engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// External controller base URL.
    pub controller_url: String,
    /// Optional controller secret (sent as a bearer token).
    pub controller_secret: Option<String>,
    /// Binary names tried in order when starting the tunnel.
    pub binaries: Vec<String>,
    /// Delay after a mode flip before groups are queried again.
    pub mode_settle_ms: u64,
    /// URL used by the engine's group latency probe.
    pub probe_url: String,
    pub probe_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            controller_url: "http://127.0.0.1:9090".into(),
            controller_secret: None,
            binaries: vec!["mihomo".into(), "clash".into(), "clash-rs".into()],
            mode_settle_ms: 200,
            probe_url: "http://www.gstatic.com/generate_204".into(),
            probe_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn mode_settle(&self) -> Duration {
        Duration::from_millis(self.mode_settle_ms)
    }
}

/// Node naming conventions of the subscription's generated config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodesConfig {
    /// Sentinel member meaning "let the engine pick".
    pub auto_node: String,
    /// Group the engine exposes in global mode.
    pub global_group: String,
    /// Smart-mode groups, in order of preference.
    pub preferred_groups: Vec<String>,
    /// Control pseudo-nodes never chosen as a carry-over target.
    pub reserved: Vec<String>,
    /// Prefixes marking internal fail-over groups.
    pub failover_prefixes: Vec<String>,
    /// Skip url-test / fallback / load-balance groups when looking for the
    /// entry group or listing groups.
    pub exclude_not_selectable: bool,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            auto_node: "auto".into(),
            global_group: "GLOBAL".into(),
            preferred_groups: vec!["XBoard".into(), "Proxy".into()],
            reserved: vec![
                "DIRECT".into(),
                "REJECT".into(),
                "REJECT-DROP".into(),
                "PASS".into(),
                "COMPATIBLE".into(),
            ],
            failover_prefixes: vec!["fallback".into()],
            exclude_not_selectable: true,
        }
    }
}

impl NodesConfig {
    /// Control pseudo-nodes and fail-over groups are never carry-over targets.
    pub fn is_reserved(&self, name: &str) -> bool {
        let name = name.trim();
        name.is_empty()
            || self.reserved.iter().any(|r| r.eq_ignore_ascii_case(name))
            || self
                .failover_prefixes
                .iter()
                .any(|p| !p.is_empty() && name.to_lowercase().starts_with(&p.to_lowercase()))
    }

    pub fn is_auto(&self, name: &str) -> bool {
        name == self.auto_node
    }

    /// Smart-mode entry group among `names`: first preferred group present,
    /// else the first group that is not the global one.
    pub fn smart_group<'a>(&self, names: &'a [String]) -> Option<&'a str> {
        self.preferred_groups
            .iter()
            .find_map(|p| names.iter().find(|n| *n == p))
            .or_else(|| names.iter().find(|n| **n != self.global_group))
            .map(String::as_str)
    }
}

/// Synchronization scheduling and state location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory for cache and profile files. Defaults to `~/.subsync/state`.
    pub state_dir: Option<PathBuf>,
    /// Interval of the background resync loop used by `subsync run`.
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            interval_secs: 3600,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when `None`.
    ///
    /// A missing file is not an error and yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.sync
            .state_dir
            .clone()
            .unwrap_or_else(|| home_dir().join(".subsync").join("state"))
    }
}

/// Default config path: `~/.subsync/config.toml`.
pub fn default_config_path() -> PathBuf {
    home_dir().join(".subsync").join("config.toml")
}

fn home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
