//! Send pacing and idle tracking, applied per connection on the socket side.

use std::time::{Duration, Instant};

/// Idle cutoff while a connection is still receiving its request header.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(120);

/// One-second send window. At most `send_rate` bytes may leave for the
/// client within a window; the window resets whenever the wall-clock second
/// advances past its start.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    window_start: Instant,
    bytes_in_window: u64,
}

impl RateWindow {
    pub fn new(now: Instant) -> RateWindow {
        RateWindow {
            window_start: now,
            bytes_in_window: 0,
        }
    }

    /// Decide how much of `want` may be sent right now under `send_rate`
    /// bytes per second. `None` means skip this tick: either there is
    /// nothing to send or the current window's quota is exhausted.
    pub fn budget(&mut self, now: Instant, want: usize, send_rate: u64) -> Option<usize> {
        if want == 0 {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed.as_secs() == 0 {
            if self.bytes_in_window >= send_rate {
                return None;
            }
            let allowance = send_rate - self.bytes_in_window;
            return Some(want.min(allowance as usize));
        }

        self.bytes_in_window = 0;
        self.window_start = now;
        Some(want.min(send_rate as usize))
    }

    /// Account `sent` bytes against the current window.
    pub fn record(&mut self, sent: usize) {
        self.bytes_in_window += sent as u64;
    }
}

/// Tracks the last moment a connection showed life on its socket.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimer {
    last_activity: Instant,
}

impl IdleTimer {
    pub fn new(now: Instant) -> IdleTimer {
        IdleTimer { last_activity: now }
    }

    /// Reset on every successful `recv`.
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn expired(&self, now: Instant, limit: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > limit
    }
}
