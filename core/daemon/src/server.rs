//! Socket listener, request framing and the service loop.

use fs_err as fs;
use std::fs::{File, OpenOptions, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use updater_monitor_protocol::{ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES};

use crate::error::{MonitorError, Result};
use crate::hub::SubscriberHub;
use crate::service::MonitorService;
use crate::shutdown;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const ACCEPT_POLL_MILLIS: u64 = 100;

/// Exclusive ownership of the service name for the life of the process.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Fails with `AlreadyRunning` when another live process holds the lock.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| MonitorError::io("Failed to create runtime directory", err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|err| MonitorError::io(format!("Failed to open {}", path.display()), err))?;

        // SAFETY: flock on a descriptor we own for the lifetime of `file`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::WouldBlock {
                return Err(MonitorError::AlreadyRunning(path.to_path_buf()));
            }
            return Err(MonitorError::io(
                format!("Failed to lock {}", path.display()),
                err,
            ));
        }

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Binds the well-known socket, replacing a stale file from a dead instance.
pub fn bind_socket(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| MonitorError::io("Failed to create socket directory", err))?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| MonitorError::io("Failed to remove existing socket", err))?;
    }

    let listener = UnixListener::bind(socket_path).map_err(|err| {
        MonitorError::io(format!("Failed to bind {}", socket_path.display()), err)
    })?;
    fs::set_permissions(socket_path, Permissions::from_mode(0o666))
        .map_err(|err| MonitorError::io("Failed to set socket permissions", err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| MonitorError::io("Failed to make listener non-blocking", err))?;
    Ok(listener)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Quit,
    Signal(i32),
    Idle,
}

/// Serves connections until Quit, a termination signal, or the idle deadline.
pub fn run(
    listener: &UnixListener,
    service: &Arc<MonitorService>,
    hub: &Arc<SubscriberHub>,
) -> StopReason {
    loop {
        if service.quit_requested() {
            return StopReason::Quit;
        }
        if let Some(signum) = shutdown::requested() {
            info!(signal = signum, "Termination signal received");
            service.coordinator().cancel_idle_timer();
            return StopReason::Signal(signum);
        }
        if service.coordinator().idle_expired(Instant::now()) {
            info!("Idle timeout reached");
            return StopReason::Idle;
        }

        match listener.accept() {
            Ok((stream, _)) => {
                let service = Arc::clone(service);
                let hub = Arc::clone(hub);
                thread::spawn(move || handle_connection(stream, &service, &hub));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MILLIS));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept monitor connection");
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MILLIS));
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, service: &MonitorService, hub: &SubscriberHub) {
    // Accepted sockets inherit the listener's non-blocking flag on some platforms.
    let _ = stream.set_nonblocking(false);

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, &response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Monitor request received");
    let method = request.method;
    let response = service.handle_request(request);
    if write_response(&mut stream, &response).is_err() {
        return;
    }

    if method == Method::Subscribe && response.ok {
        hub.subscribe(stream);
    }
}

fn read_request(stream: &mut UnixStream) -> std::result::Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
