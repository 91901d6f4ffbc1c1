//! Runtime configuration for the monitor.
//!
//! There is no configuration file. Defaults are compiled in and a handful of
//! deployment overrides are read from the environment once, at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use updater_monitor_protocol::{runtime_dir, SOCKET_NAME};

use crate::checksum::ChecksumInputs;
use crate::error::{MonitorError, Result};
use crate::prefs::PreferencesConfig;
use crate::tray::TrayLockDirs;

pub const STATE_DIR_ENV: &str = "UPDATER_MONITOR_STATE_DIR";
pub const LOG_FILE_ENV: &str = "UPDATER_MONITOR_LOG_FILE";
pub const APT_GET_ENV: &str = "UPDATER_MONITOR_APT_GET";
pub const IDLE_TIMEOUT_ENV: &str = "UPDATER_MONITOR_IDLE_TIMEOUT_SECS";
pub const DEBUG_LOG_ENV: &str = "UPDATER_MONITOR_DEBUG_LOG";

const DEFAULT_STATE_DIR: &str = "/var/lib/mx-updater-monitor";
const DEFAULT_LOG_FILE: &str = "/var/log/mx-updater-monitor.log";
const DEFAULT_APT_GET: &str = "apt-get";
const STATE_FILE_NAME: &str = "state.json";
const INSTANCE_LOCK_NAME: &str = "monitor.lock";
const RUNTIME_SENTINEL_NAME: &str = "monitor.started";

const IDLE_TIMEOUT_SECS: u64 = 4 * 60;
const LOCK_POLL_INTERVAL_SECS: u64 = 2;
const SETTLE_DELAY_SECS: u64 = 1;

pub const DEFAULT_LOCK_PATHS: &[&str] = &[
    "/var/lib/dpkg/lock-frontend",
    "/var/lib/apt/lists/lock",
    "/var/lib/dpkg/lock",
];

/// Applications that block a scan until they exit.
pub const DEFAULT_BLOCKING_APPS: &[&str] = &[
    "/usr/bin/mx-packageinstaller",
    "/usr/sbin/synaptic",
    "/usr/bin/mx-repo-manager",
    "/usr/bin/apt",
    "/usr/bin/apt-get",
    "/usr/bin/aptitude",
    "/usr/bin/nala",
    "/usr/sbin/minstall",
    "/usr/bin/repo-manager",
    "/usr/bin/packageinstaller",
];

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub state_file: PathBuf,
    pub runtime_dir: PathBuf,
    pub log_file: PathBuf,
    pub apt_get: PathBuf,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub verify_checksum: bool,
    pub lock_paths: Vec<PathBuf>,
    pub blocking_apps: Vec<PathBuf>,
    pub preferences: PreferencesConfig,
    pub checksum_inputs: ChecksumInputs,
    pub tray: TrayLockDirs,
}

impl MonitorConfig {
    pub fn from_env(verify_checksum: bool) -> Result<Self> {
        let state_dir = env_path(STATE_DIR_ENV).unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let idle_timeout = match env::var(IDLE_TIMEOUT_ENV) {
            Ok(value) if !value.trim().is_empty() => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    MonitorError::Config(format!(
                        "{} must be a whole number of seconds, got {:?}",
                        IDLE_TIMEOUT_ENV, value
                    ))
                })?;
                if secs == 0 {
                    return Err(MonitorError::Config(format!(
                        "{} must be greater than zero",
                        IDLE_TIMEOUT_ENV
                    )));
                }
                Duration::from_secs(secs)
            }
            _ => Duration::from_secs(IDLE_TIMEOUT_SECS),
        };

        Ok(Self {
            state_file: state_dir.join(STATE_FILE_NAME),
            runtime_dir: runtime_dir(),
            log_file: env_path(LOG_FILE_ENV).unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            apt_get: env_path(APT_GET_ENV).unwrap_or_else(|| PathBuf::from(DEFAULT_APT_GET)),
            idle_timeout,
            poll_interval: Duration::from_secs(LOCK_POLL_INTERVAL_SECS),
            settle_delay: Duration::from_secs(SETTLE_DELAY_SECS),
            verify_checksum,
            lock_paths: DEFAULT_LOCK_PATHS.iter().map(PathBuf::from).collect(),
            blocking_apps: DEFAULT_BLOCKING_APPS.iter().map(PathBuf::from).collect(),
            preferences: PreferencesConfig::default(),
            checksum_inputs: ChecksumInputs::default(),
            tray: TrayLockDirs::default(),
        })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(SOCKET_NAME)
    }

    pub fn instance_lock_path(&self) -> PathBuf {
        self.runtime_dir.join(INSTANCE_LOCK_NAME)
    }

    /// Marker created on the first activation after boot (the runtime dir is a tmpfs).
    pub fn runtime_sentinel(&self) -> PathBuf {
        self.runtime_dir.join(RUNTIME_SENTINEL_NAME)
    }
}

pub fn debug_forced() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_in_runtime_dir() {
        let mut config = MonitorConfig::from_env(true).expect("config");
        config.runtime_dir = PathBuf::from("/tmp/monitor-runtime");

        assert_eq!(
            config.socket_path(),
            PathBuf::from("/tmp/monitor-runtime/monitor.sock")
        );
        assert_eq!(
            config.instance_lock_path(),
            PathBuf::from("/tmp/monitor-runtime/monitor.lock")
        );
        assert_eq!(
            config.runtime_sentinel(),
            PathBuf::from("/tmp/monitor-runtime/monitor.started")
        );
    }

    #[test]
    fn defaults_cover_apt_locks_and_blockers() {
        let config = MonitorConfig::from_env(false).expect("config");
        assert!(!config.verify_checksum);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config
            .lock_paths
            .contains(&PathBuf::from("/var/lib/dpkg/lock-frontend")));
        assert!(config
            .blocking_apps
            .contains(&PathBuf::from("/usr/sbin/synaptic")));
    }
}
