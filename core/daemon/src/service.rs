//! IPC-facing operations of the monitor.
//!
//! Every operation except `quit` counts as client activity and pushes the idle
//! deadline out before doing its work. None of them wait for a scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};
use updater_monitor_protocol::{
    Method, Request, Response, UpgradeCounts, UpgradesAvailable, PROTOCOL_VERSION,
};

use crate::coordinator::ScanCoordinator;
use crate::hub::SubscriberHub;
use crate::tray::TrayLockDirs;

pub struct MonitorService {
    coordinator: Arc<ScanCoordinator>,
    hub: Arc<SubscriberHub>,
    tray: TrayLockDirs,
    idle_timeout: Duration,
    started_at: DateTime<Utc>,
    quit_requested: AtomicBool,
}

impl MonitorService {
    pub fn new(
        coordinator: Arc<ScanCoordinator>,
        hub: Arc<SubscriberHub>,
        tray: TrayLockDirs,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            hub,
            tray,
            idle_timeout,
            started_at: Utc::now(),
            quit_requested: AtomicBool::new(false),
        }
    }

    pub fn coordinator(&self) -> &Arc<ScanCoordinator> {
        &self.coordinator
    }

    pub fn upgrades_available(&self) -> UpgradesAvailable {
        self.coordinator.reset_idle_timer();
        self.coordinator.upgrades_available()
    }

    pub fn full_upgrades_available(&self) -> UpgradeCounts {
        self.upgrades_available().full_upgrade
    }

    pub fn basic_upgrades_available(&self) -> UpgradeCounts {
        self.upgrades_available().basic_upgrade
    }

    pub fn refresh(&self) {
        self.coordinator.reset_idle_timer();
        info!("Received a Refresh call");
        self.coordinator.mark_refresh_requested();
        self.coordinator.request_scan();
    }

    /// Rescans only when a tray client is around to hear about it.
    pub fn state_changed(&self) {
        self.coordinator.reset_idle_timer();
        info!("Received a StateChanged call");
        if !self.tray.any_client_running() {
            debug!("No tray icon clients running; nothing to do");
            return;
        }
        debug!("At least one tray icon client is alive");
        self.coordinator.request_scan();
    }

    pub fn quit(&self) {
        info!("Received a Quit call");
        self.coordinator.cancel_idle_timer();
        self.quit_requested.store(true, Ordering::SeqCst);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> Value {
        self.coordinator.reset_idle_timer();
        json!({
            "status": "ok",
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "scan_in_progress": self.coordinator.scan_in_progress(),
            "idle_timeout_secs": self.idle_timeout.as_secs(),
            "subscribers": self.hub.subscriber_count(),
            "started_at": self.started_at.to_rfc3339(),
        })
    }

    pub fn handle_request(&self, request: Request) -> Response {
        if request.protocol_version != PROTOCOL_VERSION {
            return Response::error(
                request.id,
                "protocol_mismatch",
                "unsupported protocol version",
            );
        }

        match request.method {
            Method::Quit => {
                self.quit();
                Response::ok(request.id, json!({ "quitting": true }))
            }
            Method::UpgradesAvailable => to_response(request.id, self.upgrades_available()),
            Method::FullUpgradesAvailable => {
                to_response(request.id, self.full_upgrades_available())
            }
            Method::BasicUpgradesAvailable => {
                to_response(request.id, self.basic_upgrades_available())
            }
            Method::Refresh => {
                self.refresh();
                Response::ok(request.id, json!({ "accepted": true }))
            }
            Method::StateChanged => {
                self.state_changed();
                Response::ok(request.id, json!({ "accepted": true }))
            }
            Method::Subscribe => {
                self.coordinator.reset_idle_timer();
                Response::ok(request.id, json!({ "subscribed": true }))
            }
            Method::GetHealth => Response::ok(request.id, self.health()),
        }
    }
}

fn to_response(id: Option<String>, value: impl serde::Serialize) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize upgrade counts: {}", err),
        ),
    }
}
