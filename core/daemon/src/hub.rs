//! Fan-out of change signals to subscribed connections.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info};
use updater_monitor_protocol::Signal;

use crate::coordinator::SignalSink;

const WRITE_TIMEOUT_SECS: u64 = 2;

struct Subscriber {
    id: u64,
    stream: UnixStream,
}

#[derive(Default)]
pub struct SubscriberHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a connection; it receives every later signal until a write
    /// to it fails.
    pub fn subscribe(&self, stream: UnixStream) -> u64 {
        let _ = stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.push(Subscriber { id, stream });
        debug!(subscriber = id, "Subscriber added");
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner().subscribers.len()
    }
}

impl SignalSink for SubscriberHub {
    fn emit(&self, signal: &Signal) {
        let mut line = match serde_json::to_vec(signal) {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, signal = signal.name(), "Failed to encode signal");
                return;
            }
        };
        line.push(b'\n');

        info!(signal = signal.name(), "Emitting signal");
        let mut inner = self.inner();
        inner.subscribers.retain_mut(|subscriber| {
            let delivered = subscriber
                .stream
                .write_all(&line)
                .and_then(|()| subscriber.stream.flush());
            match delivered {
                Ok(()) => true,
                Err(err) => {
                    debug!(subscriber = subscriber.id, error = %err, "Dropping subscriber");
                    false
                }
            }
        });
    }
}
