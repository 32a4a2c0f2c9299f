//! Throttled relay of import-engine output.
//!
//! The engine writes free-form text (progress bars, log lines) at a high
//! rate. The relay buffers it and, on each flush, forwards at most one update
//! per throttle interval, and only when the text carries a percent marker.

use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use buddy_core::events::{BridgeEvent, EventBus};
use buddy_core::types::JobId;
use chrono::Utc;
use regex::Regex;
use tracing::debug;

use crate::frontend::{FrontEndEvent, FrontEndSender};
use crate::respondable::Respondable;
use crate::types::ProgressUpdate;

/// True when `text` contains a 1-3 digit number followed by `%`.
pub fn has_progress_marker(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let marker = RE.get_or_init(|| Regex::new(r"[0-9]{1,3}%").expect("Invalid progress regex"));
    marker.is_match(text)
}

/// Minimum-interval limiter: one permit per `interval`.
///
/// The first call always succeeds.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Whether a permit would be granted at `now`, without taking it.
    pub fn is_ready_at(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Take a permit at `now` if one is available.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if self.is_ready_at(now) {
            self.last = Some(now);
            true
        } else {
            false
        }
    }
}

/// Write/flush sink handed to the import engine for one job.
///
/// Lives on the worker thread. Updates leave through a non-blocking channel
/// send, so the engine never waits on the chat platform.
pub struct ProgressRelay {
    job_id: JobId,
    respondable: Arc<dyn Respondable>,
    front_end: FrontEndSender,
    events: EventBus,
    throttle: Throttle,
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    emitted: usize,
}

impl ProgressRelay {
    pub fn new(
        job_id: JobId,
        respondable: Arc<dyn Respondable>,
        front_end: FrontEndSender,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        Self {
            job_id,
            respondable,
            front_end,
            events,
            throttle: Throttle::new(interval),
            buffer: String::new(),
            pending: Vec::new(),
            emitted: 0,
        }
    }

    /// Number of updates forwarded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Text buffered since the last flush.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    #[cfg(test)]
    fn push_str(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Flush as of `now`: forward the buffer if the throttle allows it and a
    /// progress marker is present, then clear the buffer either way.
    ///
    /// Returns whether an update was forwarded.
    pub fn relay_at(&mut self, now: Instant) -> bool {
        // Unmatched text is dropped rather than carried into the next flush.
        // Bytes of a split UTF-8 character stay in `pending`; they are not text yet.
        let forward = self.throttle.is_ready_at(now) && has_progress_marker(&self.buffer);
        if !forward {
            self.buffer.clear();
            return false;
        }

        self.throttle.try_acquire_at(now);
        let update = ProgressUpdate {
            text: std::mem::take(&mut self.buffer),
            emitted_at: Utc::now(),
        };
        let event = FrontEndEvent::Progress {
            job_id: self.job_id,
            respondable: Arc::clone(&self.respondable),
            update,
        };
        if self.front_end.send(event).is_err() {
            debug!(job_id = %self.job_id, "Front end closed, progress update dropped");
        }
        self.events.emit(BridgeEvent::ProgressRelayed {
            job_id: self.job_id,
            timestamp: Utc::now(),
        });
        self.emitted += 1;
        true
    }

    fn append_bytes(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.pending.clear();
            }
            // Incomplete sequence at the end: keep it for the next write.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.buffer
                    .push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                self.pending.drain(..valid);
            }
            Err(_) => {
                self.buffer.push_str(&String::from_utf8_lossy(&self.pending));
                self.pending.clear();
            }
        }
    }
}

impl Write for ProgressRelay {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.relay_at(Instant::now());
        Ok(())
    }
}
