//! Process inspection helpers for the monitor.

use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, System};

const PROC_ROOT: &str = "/proc";

pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// True when a process with this pid exists, including ones we may not signal.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    if unsafe { libc::kill(pid as i32, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

pub fn process_name(pid: u32) -> Option<String> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.name().to_string())
}

/// Numeric entries of /proc at the time of the call.
pub fn live_pids() -> Vec<u32> {
    let entries = match fs::read_dir(PROC_ROOT) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(error = %err, "Failed to list /proc");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .collect()
}

/// Canonical executable of a process; None for kernel threads, vanished or
/// inaccessible processes.
pub fn executable(pid: u32) -> Option<PathBuf> {
    fs::canonicalize(Path::new(PROC_ROOT).join(pid.to_string()).join("exe")).ok()
}

/// Targets of a process's open file descriptors.
pub fn open_files(pid: u32) -> Vec<PathBuf> {
    let fd_dir = Path::new(PROC_ROOT).join(pid.to_string()).join("fd");
    let entries = match fs::read_dir(fd_dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .collect()
}
