//! Durable snapshot of the last known upgrade counts.
//!
//! The file is small JSON, rewritten after every scan that changes anything.
//! Writes go to a sibling temp file that is flushed to disk before being
//! renamed over the destination, so readers only ever see a complete file.

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use updater_monitor_protocol::UpgradesAvailable;

use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorState {
    #[serde(rename = "upgrades-available")]
    pub upgrades_available: UpgradesAvailable,
    #[serde(
        rename = "checksum-of-releases",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub checksum_of_releases: Option<String>,
}

impl MonitorState {
    pub fn fresh(checksum: Option<String>) -> Self {
        Self {
            upgrades_available: UpgradesAvailable::default(),
            checksum_of_releases: checksum,
        }
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored state; a missing or malformed file yields None.
    pub fn load(&self) -> Option<MonitorState> {
        debug!(path = %self.path.display(), "Loading state file");
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No state file yet");
                return None;
            }
            Err(err) => {
                warn!(error = %err, "Could not read state file");
                return None;
            }
        };

        match serde_json::from_slice(&data) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "State file missing required keys or wrong structure"
                );
                None
            }
        }
    }

    /// Both mode entries are shape-checked by deserialization; the checksum is
    /// compared only when a non-empty one is expected.
    pub fn validate(state: &MonitorState, expected_checksum: Option<&str>) -> bool {
        let Some(expected) = expected_checksum.filter(|value| !value.is_empty()) else {
            debug!("Validating state without checksum");
            return true;
        };

        match state.checksum_of_releases.as_deref() {
            Some(stored) if stored == expected => true,
            Some(stored) => {
                info!(old = %stored, new = %expected, "Release checksum mismatch");
                false
            }
            None => {
                warn!("State file has no release checksum");
                false
            }
        }
    }

    pub fn save(&self, state: &MonitorState) -> Result<()> {
        let payload = serde_json::to_vec_pretty(state).map_err(|source| MonitorError::Json {
            context: "serializing monitor state".to_string(),
            source,
        })?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)
            .map_err(|err| MonitorError::io("creating temp state file", err))?;
        file.write_all(&payload)
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_all())
            .map_err(|err| MonitorError::io("writing temp state file", err))?;
        drop(file);

        fs::rename(&tmp_path, &self.path)
            .map_err(|err| MonitorError::io("committing state file", err))?;

        // Some filesystems cannot fsync a directory; the rename is already done.
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
                debug!(error = %err, "Directory fsync skipped");
            }
        }

        info!(path = %self.path.display(), "State saved");
        Ok(())
    }

    /// Loads the stored state, replacing it with zeros when it is absent or
    /// fails validation. The flag reports whether a scan is needed.
    pub fn init(&self, fresh_checksum: Option<String>) -> Result<(MonitorState, bool)> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| MonitorError::io("creating state directory", err))?;
        }

        if let Some(state) = self.load() {
            if Self::validate(&state, fresh_checksum.as_deref()) {
                info!("Existing state is valid");
                return Ok((state, false));
            }
        }

        info!("Initializing fresh state; scheduling upgrade check");
        let state = MonitorState::fresh(fresh_checksum.filter(|value| !value.is_empty()));
        self.save(&state)?;
        Ok((state, true))
    }
}
