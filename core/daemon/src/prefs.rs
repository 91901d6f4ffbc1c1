//! Resolution of the apt preferences file handed to the upgrade probe.
//!
//! Synaptic keeps its pins in its own preferences file, which plain apt-get
//! never reads. When Synaptic pins exist the probe is pointed at them, merged
//! behind the system preferences when those have real entries. A merged file
//! lives in a tmpfs directory and is deleted when the [`ScopedPreferences`]
//! guard is dropped.

use std::ffi::CString;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs_err as fs;
use tempfile::TempPath;

use crate::error::{MonitorError, Result};
use crate::process::effective_uid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferencesConfig {
    pub apt_preferences: PathBuf,
    pub secondary_preferences: PathBuf,
    pub secondary_executable: PathBuf,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            apt_preferences: PathBuf::from("/etc/apt/preferences"),
            secondary_preferences: PathBuf::from("/var/lib/synaptic/preferences"),
            secondary_executable: PathBuf::from("/usr/sbin/synaptic"),
        }
    }
}

#[derive(Debug)]
pub enum ScopedPreferences {
    Secondary(PathBuf),
    Merged(TempPath),
}

impl ScopedPreferences {
    pub fn path(&self) -> &Path {
        match self {
            ScopedPreferences::Secondary(path) => path,
            ScopedPreferences::Merged(path) => path,
        }
    }
}

pub trait PreferencesSource: Send + Sync {
    fn resolve(&self) -> Result<Option<ScopedPreferences>>;
}

pub struct AptPreferences {
    config: PreferencesConfig,
    temp_dir: Option<PathBuf>,
}

impl AptPreferences {
    pub fn new(config: PreferencesConfig) -> Self {
        Self {
            config,
            temp_dir: None,
        }
    }

    /// Pins the directory for merged files instead of probing tmpfs mounts.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    fn merge(&self, primary: &str, secondary: &str) -> Result<ScopedPreferences> {
        let dir = self.temp_dir.clone().unwrap_or_else(choose_tmpfs_dir);
        let prefix = format!("apt_pref.{}.", effective_uid());
        let mut tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .tempfile_in(&dir)
            .map_err(|err| {
                MonitorError::io(format!("creating merged preferences in {}", dir.display()), err)
            })?;

        tmp.write_all(primary.as_bytes())
            .and_then(|_| tmp.write_all(b"\n"))
            .and_then(|_| tmp.write_all(secondary.as_bytes()))
            .and_then(|_| tmp.flush())
            .map_err(|err| MonitorError::io("writing merged preferences", err))?;

        Ok(ScopedPreferences::Merged(tmp.into_temp_path()))
    }
}

impl PreferencesSource for AptPreferences {
    fn resolve(&self) -> Result<Option<ScopedPreferences>> {
        let config = &self.config;
        if !is_executable_file(&config.secondary_executable)
            || !is_regular_readable(&config.secondary_preferences)
        {
            return Ok(None);
        }

        let secondary = read_lossy(&config.secondary_preferences)?;
        if !secondary
            .lines()
            .any(|line| line.trim_start().starts_with("Package:"))
        {
            return Ok(None);
        }

        let shared = ScopedPreferences::Secondary(config.secondary_preferences.clone());
        if !is_regular_readable(&config.apt_preferences) {
            return Ok(Some(shared));
        }

        let primary = read_lossy(&config.apt_preferences)?;
        if !primary.lines().any(is_real_line) {
            return Ok(Some(shared));
        }

        self.merge(&primary, &secondary).map(Some)
    }
}

fn is_real_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

fn read_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|err| MonitorError::io("reading preferences", err))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn is_regular_readable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => std::fs::File::open(path).is_ok(),
        _ => false,
    }
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

fn is_writable_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

/// Prefers memory-backed directories for the short-lived merged file.
fn choose_tmpfs_dir() -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(runtime) = dirs::runtime_dir() {
        candidates.push(runtime);
    }
    candidates.push(PathBuf::from(format!("/run/user/{}", effective_uid())));
    candidates.push(PathBuf::from("/run/shm"));
    candidates.push(PathBuf::from("/dev/shm"));

    candidates
        .into_iter()
        .find(|dir| is_writable_dir(dir))
        .unwrap_or_else(std::env::temp_dir)
}
