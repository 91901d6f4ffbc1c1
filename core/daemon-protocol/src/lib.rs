//! IPC protocol types for the updater system monitor.
//!
//! This crate is shared by the monitor and its clients to prevent schema drift.
//! The monitor remains the authority on validation, but clients can reuse the
//! same types to construct requests and decode signals.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fmt;
use std::path::PathBuf;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const DEFAULT_RUNTIME_DIR: &str = "/run/mx-updater-monitor";
pub const SOCKET_NAME: &str = "monitor.sock";
pub const RUNTIME_DIR_ENV: &str = "UPDATER_MONITOR_RUNTIME_DIR";
pub const SOCKET_ENV: &str = "UPDATER_MONITOR_SOCKET";

/// Runtime directory holding the socket, honoring the deployment override.
pub fn runtime_dir() -> PathBuf {
    env::var_os(RUNTIME_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_DIR))
}

/// Socket path clients should connect to.
pub fn socket_path() -> PathBuf {
    env::var_os(SOCKET_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| runtime_dir().join(SOCKET_NAME))
}

/// Pending-change summary for one upgrade mode.
///
/// On the wire this is a plain four-element array
/// `[upgraded, newly_installed, to_remove, not_upgraded]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct UpgradeCounts {
    pub upgraded: u32,
    pub newly_installed: u32,
    pub to_remove: u32,
    pub not_upgraded: u32,
}

impl UpgradeCounts {
    pub const fn new(upgraded: u32, newly_installed: u32, to_remove: u32, not_upgraded: u32) -> Self {
        Self {
            upgraded,
            newly_installed,
            to_remove,
            not_upgraded,
        }
    }
}

impl From<[u32; 4]> for UpgradeCounts {
    fn from(values: [u32; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }
}

impl From<UpgradeCounts> for [u32; 4] {
    fn from(counts: UpgradeCounts) -> Self {
        [
            counts.upgraded,
            counts.newly_installed,
            counts.to_remove,
            counts.not_upgraded,
        ]
    }
}

impl fmt::Display for UpgradeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} upgraded, {} newly installed, {} to remove, {} not upgraded",
            self.upgraded, self.newly_installed, self.to_remove, self.not_upgraded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeMode {
    /// May install new packages and remove obsolete ones.
    FullUpgrade,
    /// Upgrades installed packages only.
    BasicUpgrade,
}

impl UpgradeMode {
    /// Evaluation order within one scan.
    pub const ALL: [UpgradeMode; 2] = [UpgradeMode::FullUpgrade, UpgradeMode::BasicUpgrade];

    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeMode::FullUpgrade => "full-upgrade",
            UpgradeMode::BasicUpgrade => "basic-upgrade",
        }
    }
}

impl fmt::Display for UpgradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both upgrade modes' counts, keyed `full-upgrade` / `basic-upgrade`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpgradesAvailable {
    pub full_upgrade: UpgradeCounts,
    pub basic_upgrade: UpgradeCounts,
}

impl UpgradesAvailable {
    pub fn get(&self, mode: UpgradeMode) -> UpgradeCounts {
        match mode {
            UpgradeMode::FullUpgrade => self.full_upgrade,
            UpgradeMode::BasicUpgrade => self.basic_upgrade,
        }
    }

    /// Returns a copy with one mode replaced.
    pub fn with(self, mode: UpgradeMode, counts: UpgradeCounts) -> Self {
        match mode {
            UpgradeMode::FullUpgrade => Self {
                full_upgrade: counts,
                ..self
            },
            UpgradeMode::BasicUpgrade => Self {
                basic_upgrade: counts,
                ..self
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "Quit")]
    Quit,
    #[serde(rename = "upgrades_available")]
    UpgradesAvailable,
    #[serde(rename = "full_upgrades_available")]
    FullUpgradesAvailable,
    #[serde(rename = "basic_upgrades_available")]
    BasicUpgradesAvailable,
    #[serde(rename = "Refresh")]
    Refresh,
    #[serde(rename = "StateChanged")]
    StateChanged,
    #[serde(rename = "Subscribe")]
    Subscribe,
    #[serde(rename = "get_health")]
    GetHealth,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Outbound notification written to every subscribed connection, one JSON
/// object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "payload")]
pub enum Signal {
    UpgradesChanged(UpgradesAvailable),
    FullUpgradesChanged(UpgradeCounts),
    BasicUpgradesChanged(UpgradeCounts),
}

impl Signal {
    pub fn for_mode(mode: UpgradeMode, counts: UpgradeCounts) -> Self {
        match mode {
            UpgradeMode::FullUpgrade => Signal::FullUpgradesChanged(counts),
            UpgradeMode::BasicUpgrade => Signal::BasicUpgradesChanged(counts),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::UpgradesChanged(_) => "UpgradesChanged",
            Signal::FullUpgradesChanged(_) => "FullUpgradesChanged",
            Signal::BasicUpgradesChanged(_) => "BasicUpgradesChanged",
        }
    }
}
