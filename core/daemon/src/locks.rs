//! Detection of package-database locks and running package tools.
//!
//! A scan must never race a package operation, so before probing we look for
//! another process holding one of the dpkg/apt lock files open, and for any
//! known package-management application still running. Processes that vanish
//! mid-scan or cannot be inspected are skipped, never reported as errors.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::process::{executable, live_pids, open_files, process_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub path: PathBuf,
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    Locked(LockHolder),
    Running(PathBuf),
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::Locked(holder) => write!(
                f,
                "{} locked by {} [{}]",
                holder.path.display(),
                holder.name,
                holder.pid
            ),
            Blocker::Running(app) => write!(f, "{} is running", app.display()),
        }
    }
}

pub trait BlockerCheck: Send + Sync {
    fn current_blocker(&self) -> Option<Blocker>;
}

pub struct AptLockObserver {
    lock_paths: Vec<PathBuf>,
    blocking_apps: Vec<PathBuf>,
}

impl AptLockObserver {
    pub fn new(lock_paths: Vec<PathBuf>, blocking_apps: Vec<PathBuf>) -> Self {
        Self {
            lock_paths,
            blocking_apps,
        }
    }

    /// First lock file held open by another process; first match wins.
    pub fn is_locked(&self) -> Option<LockHolder> {
        let own_pid = std::process::id();
        let pids: Vec<u32> = live_pids()
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        self.lock_paths.iter().find_map(|path| {
            let pid = holder_pid(path, &pids)?;
            Some(LockHolder {
                path: path.clone(),
                pid,
                name: process_name(pid).unwrap_or_default(),
            })
        })
    }
}

impl BlockerCheck for AptLockObserver {
    fn current_blocker(&self) -> Option<Blocker> {
        if let Some(holder) = self.is_locked() {
            return Some(Blocker::Locked(holder));
        }
        let (_, running) = which_running(&self.blocking_apps);
        running.into_iter().next().map(Blocker::Running)
    }
}

fn holder_pid(path: &Path, pids: &[u32]) -> Option<u32> {
    pids.iter()
        .copied()
        .find(|pid| open_files(*pid).iter().any(|open| open == path))
}

/// Whether any of `exec_paths` is the executable of a live process.
///
/// Candidates are canonicalized first so symlinked launchers match their
/// targets. The scan stops at the first match.
pub fn which_running(exec_paths: &[PathBuf]) -> (bool, BTreeSet<PathBuf>) {
    let wanted: BTreeSet<PathBuf> = exec_paths
        .iter()
        .map(|path| std::fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
        .collect();

    let mut running = BTreeSet::new();
    if let Some(found) = live_pids()
        .into_iter()
        .filter_map(executable)
        .find(|target| wanted.contains(target))
    {
        running.insert(found);
    }

    (!running.is_empty(), running)
}
