//! Socket client for the updater monitor.
//!
//! Failures are returned as readable strings; the caller decides how loud to be.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use updater_monitor_protocol::{Method, Request, Response, Signal, MAX_REQUEST_BYTES};

const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;

pub struct MonitorClient {
    reader: BufReader<UnixStream>,
}

impl MonitorClient {
    pub fn connect(socket: &Path) -> Result<Self, String> {
        let stream = UnixStream::connect(socket).map_err(|err| {
            format!(
                "Failed to connect to monitor socket {}: {}",
                socket.display(),
                err
            )
        })?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// Sends one request and returns the monitor's answer, or its error as text.
    pub fn call(&mut self, method: Method) -> Result<Response, String> {
        let stream = self.reader.get_mut();
        serde_json::to_writer(&mut *stream, &Request::new(method))
            .map_err(|err| format!("Failed to write request: {}", err))?;
        stream
            .write_all(b"\n")
            .map_err(|err| format!("Failed to flush request: {}", err))?;
        stream.flush().ok();

        let response: Response = self
            .read_line()?
            .ok_or_else(|| "Monitor closed the connection without answering".to_string())
            .and_then(|line| {
                serde_json::from_str(&line)
                    .map_err(|err| format!("Failed to parse response JSON: {}", err))
            })?;

        if response.ok {
            Ok(response)
        } else {
            Err(response
                .error
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or_else(|| "Unknown monitor error".to_string()))
        }
    }

    /// Subscribes and hands every signal to `on_signal` until the monitor
    /// closes the connection.
    pub fn watch(mut self, mut on_signal: impl FnMut(Signal)) -> Result<(), String> {
        self.call(Method::Subscribe)?;
        let _ = self.reader.get_ref().set_read_timeout(None);

        while let Some(line) = self.read_line()? {
            match serde_json::from_str::<Signal>(&line) {
                Ok(signal) => on_signal(signal),
                Err(err) => tracing::warn!(error = %err, "Ignoring malformed signal line"),
            }
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, String> {
        let mut line = String::new();
        let read = (&mut self.reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_line(&mut line)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                    "Timed out waiting for monitor response".to_string()
                }
                _ => format!("Failed to read response: {}", err),
            })?;
        if read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_REQUEST_BYTES {
            return Err("Response exceeded maximum size".to_string());
        }
        Ok(Some(line.trim_end().to_string()))
    }
}
