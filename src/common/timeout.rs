//! Per-phase deadline policy for HTTP sessions on the TLS port.
//!
//! Every duration is optional. A missing phase falls back to the next more
//! general timeout, and finally to "no deadline":
//!
//! ```text
//! header: read_header -> read -> none
//! body:   read -> none
//! write:  write -> none
//! idle:   idle -> read -> none
//! ```

use std::time::Duration;
use tokio::time::Instant;

/// Which part of an exchange a deadline is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading a request line and headers (also used for the sniffing read).
    Header,
    /// Reading a request body.
    Body,
    /// Flushing a response.
    Write,
    /// Waiting for the next request on a kept-alive connection.
    Idle,
}

/// Optional durations for each phase; `None` means "inherit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub read_header: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub idle: Option<Duration>,
}

impl TimeoutPolicy {
    /// Build a policy from millisecond values where 0 means unset.
    pub fn from_millis(read_header: u64, read: u64, write: u64, idle: u64) -> Self {
        TimeoutPolicy {
            read_header: non_zero(read_header),
            read: non_zero(read),
            write: non_zero(write),
            idle: non_zero(idle),
        }
    }

    /// Effective duration for a phase after applying fallbacks.
    pub fn duration(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Header => self.read_header.or(self.read),
            Phase::Body => self.read,
            Phase::Write => self.write,
            Phase::Idle => self.idle.or(self.read),
        }
    }

    /// Absolute deadline for a phase starting now.
    pub fn deadline(&self, phase: Phase) -> Option<Instant> {
        self.deadline_from(Instant::now(), phase)
    }

    pub fn deadline_from(&self, now: Instant, phase: Phase) -> Option<Instant> {
        self.duration(phase).map(|d| now + d)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
