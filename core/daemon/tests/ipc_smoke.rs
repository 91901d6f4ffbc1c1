use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use updater_monitor_protocol::{
    Method, Request, Response, Signal, UpgradeCounts, UpgradesAvailable,
};

const FAKE_APT_GET: &str = r#"#!/bin/sh
case "$*" in
  *Upgrade-Allow-New=false*)
    echo "Reading package lists..."
    echo "1 upgraded, 0 newly installed, 0 to remove and 2 not upgraded."
    ;;
  *)
    echo "Reading package lists..."
    echo "   Inst foo [1.0] (1.1 Debian:stable)"
    echo "3 upgraded, 1 newly installed, 0 to remove and 0 not upgraded."
    ;;
esac
exit 1
"#;

const FULL: UpgradeCounts = UpgradeCounts::new(3, 1, 0, 0);
const BASIC: UpgradeCounts = UpgradeCounts::new(1, 0, 0, 2);

struct MonitorGuard {
    child: Child,
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let root = TempDir::new().expect("Failed to create sandbox");
        let apt_get = root.path().join("apt-get");
        std::fs::write(&apt_get, FAKE_APT_GET).expect("write fake apt-get");
        std::fs::set_permissions(&apt_get, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake apt-get");
        Self { root }
    }

    fn runtime_dir(&self) -> PathBuf {
        self.root.path().join("run")
    }

    fn socket(&self) -> PathBuf {
        self.runtime_dir().join("monitor.sock")
    }

    fn state_file(&self) -> PathBuf {
        self.root.path().join("state").join("state.json")
    }

    fn command(&self, idle_secs: u64) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_updater-monitor"));
        command
            .arg("--no-log-file")
            .arg("--no-color")
            .env("UPDATER_MONITOR_STATE_DIR", self.root.path().join("state"))
            .env("UPDATER_MONITOR_RUNTIME_DIR", self.runtime_dir())
            .env("UPDATER_MONITOR_APT_GET", self.root.path().join("apt-get"))
            .env("UPDATER_MONITOR_IDLE_TIMEOUT_SECS", idle_secs.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    fn spawn(&self, idle_secs: u64) -> MonitorGuard {
        let child = self
            .command(idle_secs)
            .spawn()
            .expect("Failed to spawn updater-monitor");
        MonitorGuard { child }
    }
}

fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for monitor socket at {}", path.display());
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("Failed to poll child") {
            return status;
        }
        sleep(Duration::from_millis(50));
    }
    panic!("Monitor did not exit within {:?}", timeout);
}

fn connect(socket: &Path) -> BufReader<UnixStream> {
    let stream = UnixStream::connect(socket).expect("Failed to connect to monitor socket");
    stream
        .set_read_timeout(Some(Duration::from_secs(20)))
        .expect("set read timeout");
    BufReader::new(stream)
}

fn send(reader: &mut BufReader<UnixStream>, method: Method) -> Response {
    let stream = reader.get_mut();
    serde_json::to_writer(&mut *stream, &Request::new(method)).expect("serialize request");
    stream.write_all(b"\n").expect("write request");
    stream.flush().ok();
    let line = read_line(reader);
    serde_json::from_str(&line).expect("Failed to parse response JSON")
}

fn read_line(reader: &mut BufReader<UnixStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).expect("Failed to read line");
    line.trim_end().to_string()
}

fn request(socket: &Path, method: Method) -> Response {
    send(&mut connect(socket), method)
}

fn wait_for_counts(socket: &Path, expected: UpgradesAvailable) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        let response = request(socket, Method::UpgradesAvailable);
        assert!(response.ok, "upgrades_available failed: {:?}", response.error);
        let available: UpgradesAvailable =
            serde_json::from_value(response.data.expect("data")).expect("decode counts");
        if available == expected {
            return;
        }
        sleep(Duration::from_millis(100));
    }
    panic!("Monitor never reported {:?}", expected);
}

fn wait_for_scan_to_finish(socket: &Path) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if request_health(socket)["scan_in_progress"] == false {
            return;
        }
        sleep(Duration::from_millis(100));
    }
    panic!("Scan never finished");
}

fn request_health(socket: &Path) -> serde_json::Value {
    let response = request(socket, Method::GetHealth);
    assert!(response.ok);
    response.data.expect("health data")
}

#[test]
fn monitor_refuses_to_start_without_root() {
    if running_as_root() {
        return;
    }
    let sandbox = Sandbox::new();
    let status = sandbox
        .command(60)
        .status()
        .expect("Failed to run updater-monitor");
    assert!(!status.success());
    assert!(!sandbox.socket().exists());
}

#[test]
fn monitor_scans_signals_and_quits() {
    if !running_as_root() {
        return;
    }
    let sandbox = Sandbox::new();
    let mut guard = sandbox.spawn(120);
    let socket = sandbox.socket();
    wait_for_socket(&socket, Duration::from_secs(5));

    let expected = UpgradesAvailable {
        full_upgrade: FULL,
        basic_upgrade: BASIC,
    };
    wait_for_counts(&socket, expected);

    let state: serde_json::Value =
        serde_json::from_slice(&std::fs::read(sandbox.state_file()).expect("read state"))
            .expect("state json");
    assert_eq!(state["upgrades-available"]["full-upgrade"], serde_json::json!([3, 1, 0, 0]));
    assert_eq!(state["upgrades-available"]["basic-upgrade"], serde_json::json!([1, 0, 0, 2]));

    let full = request(&socket, Method::FullUpgradesAvailable);
    assert_eq!(full.data, Some(serde_json::json!([3, 1, 0, 0])));

    wait_for_scan_to_finish(&socket);
    let mut subscriber = connect(&socket);
    let subscribed = send(&mut subscriber, Method::Subscribe);
    assert!(subscribed.ok);

    let refresh = request(&socket, Method::Refresh);
    assert!(refresh.ok);

    let signals: Vec<Signal> = (0..3)
        .map(|_| serde_json::from_str(&read_line(&mut subscriber)).expect("signal json"))
        .collect();
    assert_eq!(
        signals,
        vec![
            Signal::FullUpgradesChanged(FULL),
            Signal::BasicUpgradesChanged(BASIC),
            Signal::UpgradesChanged(expected),
        ]
    );

    let mut second = sandbox
        .command(120)
        .spawn()
        .expect("Failed to spawn second monitor");
    let second_status = wait_for_exit(&mut second, Duration::from_secs(10));
    assert!(second_status.success(), "second instance should exit quietly");

    let quit = request(&socket, Method::Quit);
    assert!(quit.ok);
    let status = wait_for_exit(&mut guard.child, Duration::from_secs(10));
    assert!(status.success());
    assert!(!socket.exists());
}

#[test]
fn monitor_rejects_malformed_requests() {
    if !running_as_root() {
        return;
    }
    let sandbox = Sandbox::new();
    let _guard = sandbox.spawn(120);
    let socket = sandbox.socket();
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut reader = connect(&socket);
    reader
        .get_mut()
        .write_all(b"{\"protocol_version\":1,\"method\":\"Reboot\"}\n")
        .expect("write request");
    let response: Response = serde_json::from_str(&read_line(&mut reader)).expect("response");
    assert!(!response.ok);
    assert_eq!(response.error.expect("error").code, "invalid_json");

    let mut future_request = Request::new(Method::GetHealth);
    future_request.protocol_version = 2;
    let mut reader = connect(&socket);
    serde_json::to_writer(reader.get_mut(), &future_request).expect("serialize");
    reader.get_mut().write_all(b"\n").expect("write");
    let response: Response = serde_json::from_str(&read_line(&mut reader)).expect("response");
    assert_eq!(response.error.expect("error").code, "protocol_mismatch");

    let health = request_health(&socket);
    assert_eq!(health["status"], "ok");
}

#[test]
fn monitor_exits_when_idle() {
    if !running_as_root() {
        return;
    }
    let sandbox = Sandbox::new();
    let mut guard = sandbox.spawn(1);
    wait_for_socket(&sandbox.socket(), Duration::from_secs(5));

    let status = wait_for_exit(&mut guard.child, Duration::from_secs(30));
    assert!(status.success());
    assert!(sandbox.state_file().exists());
}
