//! Updater system monitor entrypoint.
//!
//! A root-owned, single-instance service that counts pending package upgrades
//! and announces changes to tray clients over a Unix socket. It exits on its
//! own once nobody has talked to it for the idle timeout.

use clap::Parser;
use fs_err as fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

mod checksum;
mod config;
mod coordinator;
mod error;
mod hub;
mod locks;
mod logging;
mod prefs;
mod probe;
mod process;
mod server;
mod service;
mod shutdown;
mod state_store;
mod tray;

use checksum::{ChecksumSource, ReleaseChecksum};
use config::MonitorConfig;
use coordinator::{ScanCoordinator, ScanDeps, ScanTiming};
use error::{MonitorError, Result};
use hub::SubscriberHub;
use locks::AptLockObserver;
use prefs::AptPreferences;
use probe::AptGetProbe;
use server::{InstanceLock, StopReason};
use service::MonitorService;
use state_store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "updater-monitor")]
#[command(about = "Counts pending package upgrades and notifies tray clients")]
#[command(version)]
struct Cli {
    /// Log to stderr only
    #[arg(long)]
    no_log_file: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Skip release checksum validation of the stored state
    #[arg(long)]
    no_checksum: bool,

    /// Disable colored stderr output
    #[arg(long)]
    no_color: bool,
}

fn main() {
    let cli = Cli::parse();

    if process::effective_uid() != 0 {
        eprintln!("ERROR: {}", MonitorError::NotRoot);
        std::process::exit(1);
    }

    let config = match MonitorConfig::from_env(!cli.no_checksum) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            std::process::exit(1);
        }
    };

    let log_guard = match logging::init(logging::LogOptions {
        debug: cli.debug || config::debug_forced(),
        color: !cli.no_color,
        log_file: (!cli.no_log_file).then_some(config.log_file.as_path()),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            std::process::exit(1);
        }
    };

    let exit_code = match run(config) {
        Ok(reason) => {
            info!(reason = ?reason, "Updater monitor stopped");
            0
        }
        Err(MonitorError::AlreadyRunning(path)) => {
            info!(lock = %path.display(), "Another updater monitor is already running");
            0
        }
        Err(err) => {
            error!(error = %err, "Updater monitor failed");
            1
        }
    };

    // Flush the file sink before exiting.
    drop(log_guard);
    std::process::exit(exit_code);
}

fn run(config: MonitorConfig) -> Result<StopReason> {
    let instance = InstanceLock::acquire(&config.instance_lock_path())?;
    debug!(lock = %instance.path().display(), "Instance lock acquired");

    let socket_path = config.socket_path();
    let listener = server::bind_socket(&socket_path)?;
    shutdown::install_handlers();
    info!(path = %socket_path.display(), "Updater monitor started");

    let store = StateStore::new(&config.state_file);
    let checksum = ReleaseChecksum::new(config.checksum_inputs.clone());
    let fresh_checksum = config.verify_checksum.then(|| checksum.compute());
    let (state, check_needed) = store.init(fresh_checksum)?;

    let hub = Arc::new(SubscriberHub::new());
    let deps = ScanDeps {
        blockers: Box::new(AptLockObserver::new(
            config.lock_paths.clone(),
            config.blocking_apps.clone(),
        )),
        probe: Box::new(AptGetProbe::new(&config.apt_get)),
        preferences: Box::new(AptPreferences::new(config.preferences.clone())),
        checksum: Box::new(checksum),
        store,
        sink: hub.clone(),
    };
    let timing = ScanTiming {
        poll_interval: config.poll_interval,
        settle_delay: config.settle_delay,
        idle_timeout: config.idle_timeout,
    };
    let coordinator = ScanCoordinator::new(deps, timing, state.upgrades_available);
    let service = Arc::new(MonitorService::new(
        Arc::clone(&coordinator),
        Arc::clone(&hub),
        config.tray.clone(),
        config.idle_timeout,
    ));

    let first_activation = touch_sentinel(&config.runtime_sentinel())?;
    if first_activation || check_needed {
        debug!(first_activation, check_needed, "Scheduling upgrade check");
        coordinator.request_scan();
    }

    coordinator.reset_idle_timer();
    let reason = server::run(&listener, &service, &hub);

    if let Err(err) = fs::remove_file(&socket_path) {
        debug!(error = %err, "Failed to remove socket on exit");
    }
    Ok(reason)
}

/// Creates the runtime sentinel, reporting whether it was missing.
fn touch_sentinel(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    fs::write(path, b"")
        .map_err(|err| MonitorError::io("Failed to create runtime sentinel", err))?;
    info!(path = %path.display(), "First activation since boot");
    Ok(true)
}
