//! Single-flight upgrade scans.
//!
//! At most one scan runs at a time. A scan waits (without timeout) until no
//! package tool holds the dpkg/apt locks, probes both upgrade modes in order,
//! persists every change before announcing it, and finally refreshes the
//! stored release checksum.
//!
//! All shared fields, including the idle deadline, sit behind one mutex. The
//! idle deadline is cleared while a scan runs so the service cannot time out
//! underneath it, and is re-armed once the scan has finished.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use updater_monitor_protocol::{Signal, UpgradeCounts, UpgradeMode, UpgradesAvailable};

use crate::checksum::ChecksumSource;
use crate::error::Result;
use crate::locks::{Blocker, BlockerCheck};
use crate::prefs::PreferencesSource;
use crate::probe::UpgradeProbe;
use crate::state_store::{MonitorState, StateStore};

/// Receiver of outbound change notifications.
pub trait SignalSink: Send + Sync {
    fn emit(&self, signal: &Signal);
}

pub struct ScanDeps {
    pub blockers: Box<dyn BlockerCheck>,
    pub probe: Box<dyn UpgradeProbe>,
    pub preferences: Box<dyn PreferencesSource>,
    pub checksum: Box<dyn ChecksumSource>,
    pub store: StateStore,
    pub sink: Arc<dyn SignalSink>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanTiming {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Default)]
struct ScanSession {
    in_progress: bool,
    refresh_requested: bool,
    upgrades: UpgradesAvailable,
    idle_deadline: Option<Instant>,
}

pub struct ScanCoordinator {
    session: Mutex<ScanSession>,
    deps: ScanDeps,
    timing: ScanTiming,
}

impl ScanCoordinator {
    pub fn new(deps: ScanDeps, timing: ScanTiming, initial: UpgradesAvailable) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(ScanSession {
                upgrades: initial,
                ..ScanSession::default()
            }),
            deps,
            timing,
        })
    }

    fn session(&self) -> MutexGuard<'_, ScanSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn upgrades_available(&self) -> UpgradesAvailable {
        self.session().upgrades
    }

    pub fn scan_in_progress(&self) -> bool {
        self.session().in_progress
    }

    pub fn mark_refresh_requested(&self) {
        self.session().refresh_requested = true;
    }

    fn refresh_requested(&self) -> bool {
        self.session().refresh_requested
    }

    /// Starts a scan on a worker thread unless one is already running.
    ///
    /// Returns immediately; the handle is None when the call was a no-op.
    pub fn request_scan(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        {
            let mut session = self.session();
            if session.in_progress {
                debug!("Check for updates already running; request ignored");
                return None;
            }
            session.in_progress = true;
            session.idle_deadline = None;
        }
        debug!("Idle timer cancelled for scan");

        let coordinator = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("upgrade-scan".to_string())
            .spawn(move || coordinator.run_scan());

        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "Failed to spawn scan worker");
                self.finish_scan();
                None
            }
        }
    }

    /// Re-arms the idle deadline, or keeps it cleared while a scan runs.
    pub fn reset_idle_timer(&self) {
        let mut session = self.session();
        if session.in_progress {
            session.idle_deadline = None;
            return;
        }
        session.idle_deadline = Some(Instant::now() + self.timing.idle_timeout);
    }

    pub fn cancel_idle_timer(&self) {
        self.session().idle_deadline = None;
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.session().idle_deadline
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        self.session()
            .idle_deadline
            .is_some_and(|deadline| now >= deadline)
    }

    fn run_scan(&self) {
        info!("Starting check for updates");
        match panic::catch_unwind(AssertUnwindSafe(|| self.scan())) {
            Ok(Ok(())) => debug!("Check for updates finished"),
            Ok(Err(err)) => error!(error = %err, "Check for updates failed"),
            Err(_) => error!("Check for updates panicked"),
        }
        self.finish_scan();
    }

    fn finish_scan(&self) {
        {
            let mut session = self.session();
            session.in_progress = false;
            session.refresh_requested = false;
        }
        self.reset_idle_timer();
    }

    fn scan(&self) -> Result<()> {
        wait_until_clear(
            self.deps.blockers.as_ref(),
            self.timing.poll_interval,
            thread::sleep,
        );
        debug!("Apt is not locked; no blocking apps running");
        if !self.timing.settle_delay.is_zero() {
            thread::sleep(self.timing.settle_delay);
        }

        let stored = self
            .deps
            .store
            .load()
            .filter(|state| StateStore::validate(state, None));
        let old = {
            let mut session = self.session();
            if let Some(state) = &stored {
                session.upgrades = state.upgrades_available;
            }
            session.upgrades
        };
        let mut state = MonitorState {
            upgrades_available: old,
            checksum_of_releases: stored.and_then(|state| state.checksum_of_releases),
        };

        for mode in UpgradeMode::ALL {
            let previous = old.get(mode);
            let counts = match self.probe_mode(mode) {
                Ok(counts) => counts,
                Err(err) => {
                    warn!(mode = %mode, error = %err, "Upgrade probe failed; keeping previous counts");
                    previous
                }
            };

            if counts != previous {
                state.upgrades_available = state.upgrades_available.with(mode, counts);
                self.deps.store.save(&state)?;
                self.session().upgrades = state.upgrades_available;
                info!(mode = %mode, counts = %counts, "Upgrade counts changed");
                self.deps.sink.emit(&Signal::for_mode(mode, counts));
            } else if self.refresh_requested() {
                self.deps.sink.emit(&Signal::for_mode(mode, counts));
            }
        }

        let checksum = self.deps.checksum.compute();
        if state.checksum_of_releases.as_deref() != Some(checksum.as_str()) {
            debug!(checksum = %checksum, "Release checksum changed");
            state.checksum_of_releases = Some(checksum);
            self.deps.store.save(&state)?;
        }

        let current = state.upgrades_available;
        if current != old {
            info!("Emitting UpgradesChanged");
            self.deps.sink.emit(&Signal::UpgradesChanged(current));
        } else if self.refresh_requested() {
            self.deps.sink.emit(&Signal::UpgradesChanged(current));
        }

        Ok(())
    }

    fn probe_mode(&self, mode: UpgradeMode) -> Result<UpgradeCounts> {
        let preferences = self.deps.preferences.resolve()?;
        let path = preferences.as_ref().map(|prefs| prefs.path());
        debug!(mode = %mode, preferences = ?path, "Probing upgrades");
        self.deps.probe.probe(mode, path)
    }
}

/// Polls `check` until nothing blocks a scan, pausing `interval` between
/// polls. Returns the number of pauses taken.
pub fn wait_until_clear(
    check: &dyn BlockerCheck,
    interval: Duration,
    mut pause: impl FnMut(Duration),
) -> u32 {
    let mut pauses = 0;
    let mut was_locked = false;
    let mut seen_apps = BTreeSet::new();

    while let Some(blocker) = check.current_blocker() {
        let first_sighting = match &blocker {
            Blocker::Locked(_) => !was_locked,
            Blocker::Running(app) => seen_apps.insert(app.clone()),
        };
        was_locked = matches!(blocker, Blocker::Locked(_));
        if first_sighting {
            debug!(blocker = %blocker, "Waiting before checking for updates");
        }

        pause(interval);
        pauses += 1;
    }

    pauses
}
