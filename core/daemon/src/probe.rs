//! Read-only upgrade probe backed by `apt-get` simulation.
//!
//! apt-get runs in trivial-only mode with locking disabled, so it never
//! touches the system and exits non-zero whenever anything is pending. The
//! exit status is therefore ignored; only the summary line on stdout counts.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use updater_monitor_protocol::{UpgradeCounts, UpgradeMode};

use crate::error::{MonitorError, Result};

const PROBE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const BASE_OPTIONS: &[&str] = &[
    "-q",
    "-o",
    "quiet::NoStatistics=true",
    "-o",
    "quiet::NoProgress=true",
    "-o",
    "Debug::NoLocking=true",
    "-o",
    "Apt::Get::Show-Upgraded=false",
    "-o",
    "APT::Get::Show-User-Simulation-Note=false",
    "-o",
    "APT::Get::Show-Versions=false",
    "-o",
    "Apt::Get::Trivial-Only=true",
];

// Four integers separated and surrounded by non-digit text, e.g.
// "3 upgraded, 0 newly installed, 1 to remove and 5 not upgraded."
static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\D*(\d+)\D+(\d+)\D+(\d+)\D+(\d+)\D*$").expect("summary regex is valid")
});

pub trait UpgradeProbe: Send + Sync {
    fn probe(&self, mode: UpgradeMode, preferences: Option<&Path>) -> Result<UpgradeCounts>;
}

pub struct AptGetProbe {
    program: PathBuf,
}

impl AptGetProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command_args(mode: UpgradeMode, preferences: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = BASE_OPTIONS.iter().map(|arg| arg.to_string()).collect();
        if mode == UpgradeMode::BasicUpgrade {
            args.push("-o".to_string());
            args.push("APT::Get::Upgrade-Allow-New=false".to_string());
        }
        if let Some(path) = preferences {
            args.push("-o".to_string());
            args.push(format!("Dir::Etc::preferences={}", path.display()));
        }
        args.push(apt_action(mode).to_string());
        args
    }
}

impl UpgradeProbe for AptGetProbe {
    fn probe(&self, mode: UpgradeMode, preferences: Option<&Path>) -> Result<UpgradeCounts> {
        let args = Self::command_args(mode, preferences);
        let command = format!("{} {}", self.program.display(), args.join(" "));
        tracing::debug!(%command, "Running upgrade probe");

        let output = Command::new(&self.program)
            .args(&args)
            .env_clear()
            .env("LC_ALL", "C")
            .env("PATH", PROBE_PATH)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| MonitorError::ProbeSpawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(MonitorError::ProbeNoOutput { command });
        }

        let Some(counts) = parse_summary(&stdout) else {
            tracing::debug!(
                mode = %mode,
                status = ?output.status.code(),
                "apt-get printed no summary line"
            );
            return Err(MonitorError::ProbeNoSummary { command });
        };
        tracing::debug!(
            mode = %mode,
            status = ?output.status.code(),
            counts = %counts,
            "Upgrade probe finished"
        );
        Ok(counts)
    }
}

fn apt_action(mode: UpgradeMode) -> &'static str {
    match mode {
        UpgradeMode::FullUpgrade => "full-upgrade",
        UpgradeMode::BasicUpgrade => "upgrade",
    }
}

/// First non-indented line carrying exactly four integers.
pub fn parse_summary(text: &str) -> Option<UpgradeCounts> {
    text.lines()
        .filter(|line| {
            line.chars()
                .next()
                .is_some_and(|first| !first.is_whitespace())
        })
        .find_map(|line| {
            let captures = SUMMARY_RE.captures(line)?;
            let mut values = [0u32; 4];
            for (slot, value) in values.iter_mut().enumerate() {
                *value = match captures.get(slot + 1) {
                    Some(group) => group.as_str().parse().ok()?,
                    None => 0,
                };
            }
            Some(UpgradeCounts::from(values))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const APT_OUTPUT: &str = "Reading package lists...
Building dependency tree...
Reading state information...
Calculating upgrade...
The following packages will be upgraded:
  libc6 3 packages 4 x 5 y 6
3 upgraded, 0 newly installed, 1 to remove and 5 not upgraded.
E: Trivial Only specified but this is not a trivial operation.
";

    #[test]
    fn parses_standard_summary() {
        assert_eq!(
            parse_summary(APT_OUTPUT),
            Some(UpgradeCounts::new(3, 0, 1, 5))
        );
    }

    #[test]
    fn skips_indented_lines() {
        let text = "  1 a 2 b 3 c 4\n7 upgraded, 1 newly installed, 0 to remove and 2 not upgraded.\n";
        assert_eq!(parse_summary(text), Some(UpgradeCounts::new(7, 1, 0, 2)));
    }

    #[test]
    fn tolerates_localized_text() {
        let text = "0 aktualisiert, 0 neu installiert, 0 zu entfernen und 12 nicht aktualisiert.\n";
        assert_eq!(parse_summary(text), Some(UpgradeCounts::new(0, 0, 0, 12)));
    }

    #[test]
    fn rejects_lines_with_other_number_counts() {
        assert_eq!(parse_summary("Need to get 3 of 4 MB.\n"), None);
        assert_eq!(parse_summary("1 2 3 4 5\n"), None);
        assert_eq!(parse_summary(""), None);
    }

    #[test]
    fn skips_overflowing_numbers() {
        let text = "99999999999 upgraded, 0 newly installed, 0 to remove and 0 not upgraded.\n2 upgraded, 0 newly installed, 0 to remove and 0 not upgraded.\n";
        assert_eq!(parse_summary(text), Some(UpgradeCounts::new(2, 0, 0, 0)));
    }

    #[test]
    fn basic_mode_disallows_new_packages() {
        let args = AptGetProbe::command_args(UpgradeMode::BasicUpgrade, None);
        assert!(args.contains(&"APT::Get::Upgrade-Allow-New=false".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("upgrade"));

        let args = AptGetProbe::command_args(
            UpgradeMode::FullUpgrade,
            Some(Path::new("/run/shm/apt_pref.0.x")),
        );
        assert!(!args.contains(&"APT::Get::Upgrade-Allow-New=false".to_string()));
        assert!(args.contains(&"Dir::Etc::preferences=/run/shm/apt_pref.0.x".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("full-upgrade"));
    }

    fn fake_apt_get(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("apt-get");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[test]
    fn probe_ignores_nonzero_exit_status() {
        let temp_dir = TempDir::new().expect("temp dir");
        let program = fake_apt_get(
            temp_dir.path(),
            "echo \"4 upgraded, 2 newly installed, 0 to remove and 0 not upgraded.\"; exit 1",
        );

        let counts = AptGetProbe::new(program)
            .probe(UpgradeMode::FullUpgrade, None)
            .expect("probe");
        assert_eq!(counts, UpgradeCounts::new(4, 2, 0, 0));
    }

    #[test]
    fn probe_runs_with_c_locale() {
        let temp_dir = TempDir::new().expect("temp dir");
        let program = fake_apt_get(
            temp_dir.path(),
            "[ \"$LC_ALL\" = C ] && echo \"1 upgraded, 0 newly installed, 0 to remove and 0 not upgraded.\"",
        );

        let counts = AptGetProbe::new(program)
            .probe(UpgradeMode::BasicUpgrade, None)
            .expect("probe");
        assert_eq!(counts, UpgradeCounts::new(1, 0, 0, 0));
    }

    #[test]
    fn apt_output_without_summary_is_an_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let program = fake_apt_get(
            temp_dir.path(),
            "echo 'Reading package lists...'; echo 'E: dpkg was interrupted' >&2; exit 100",
        );

        assert!(matches!(
            AptGetProbe::new(program).probe(UpgradeMode::FullUpgrade, None),
            Err(MonitorError::ProbeNoSummary { .. })
        ));
    }

    #[test]
    fn probe_failures_are_errors() {
        let temp_dir = TempDir::new().expect("temp dir");
        let silent = fake_apt_get(temp_dir.path(), "exit 100");
        assert!(matches!(
            AptGetProbe::new(silent).probe(UpgradeMode::FullUpgrade, None),
            Err(MonitorError::ProbeNoOutput { .. })
        ));

        let missing = AptGetProbe::new(temp_dir.path().join("missing-apt-get"));
        assert!(matches!(
            missing.probe(UpgradeMode::FullUpgrade, None),
            Err(MonitorError::ProbeSpawn { .. })
        ));
    }
}
