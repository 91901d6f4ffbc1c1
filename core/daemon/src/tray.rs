//! Liveness of tray-icon clients.
//!
//! Every tray icon holds a lock file containing its pid, either in the shared
//! lock directory or in its user's runtime directory. A file we cannot read or
//! parse counts as a live client; a file naming a dead pid is stale and is
//! removed.

use fs_err as fs;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::process::is_pid_alive;

const TRAYICON_LOCK_NAME: &str = "mx-updater-systrayicon";
const MIN_USER_UID: u32 = 1000;

static TRAYICON_LOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^{}-(\d+)\.lock$", TRAYICON_LOCK_NAME))
        .expect("tray lock regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayLockDirs {
    pub shared_lock_dir: PathBuf,
    pub user_runtime_root: PathBuf,
}

impl Default for TrayLockDirs {
    fn default() -> Self {
        Self {
            shared_lock_dir: PathBuf::from("/run/lock"),
            user_runtime_root: PathBuf::from("/run/user"),
        }
    }
}

impl TrayLockDirs {
    pub fn any_client_running(&self) -> bool {
        self.shared_lock_files()
            .iter()
            .chain(self.user_lock_files().iter())
            .any(|path| lock_file_alive(path))
    }

    fn shared_lock_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.shared_lock_dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| TRAYICON_LOCK_RE.is_match(name))
            })
            .map(|entry| entry.path())
            .collect()
    }

    fn user_lock_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.user_runtime_root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let uid: u32 = name.parse().ok()?;
                (uid >= MIN_USER_UID)
                    .then(|| entry.path().join(format!("{}-{}.lock", TRAYICON_LOCK_NAME, name)))
            })
            .filter(|path| path.is_file())
            .collect()
    }
}

fn lock_file_alive(path: &Path) -> bool {
    let pid = match fs::read_to_string(path) {
        Ok(text) => match text.trim().parse::<u32>() {
            Ok(pid) => pid,
            Err(_) => return true,
        },
        Err(_) => return true,
    };

    if is_pid_alive(pid) {
        return true;
    }

    debug!(path = %path.display(), pid, "Removing stale tray icon lock");
    if let Err(err) = fs::remove_file(path) {
        debug!(error = %err, "Failed to remove stale tray icon lock");
    }
    false
}
