//! Correlates an asynchronous error response (which carries only a
//! notification id) back to the device token it was sent to.
//!
//! The gateway can report an error for a notification sent several
//! round-trips ago, so a single generation of ids is not enough: we keep
//! the current generation plus the one before it, rotating on a timer.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::token::DeviceToken;

pub struct RecentNotificationWindow {
    rotate_interval_secs: u64,
    rotated_at: i64,
    current: HashMap<u32, DeviceToken>,
    previous: HashMap<u32, DeviceToken>,
}

impl RecentNotificationWindow {
    /// `max_error_wait` is the same per-notification error-wait budget the
    /// push agent uses; the window spans roughly 600x that, with a 10s
    /// floor so a zero or tiny wait still leaves a usable correlation
    /// window for out-of-band errors.
    pub fn new(max_error_wait: f64) -> Self {
        let rotate_interval_secs = (600.0 * max_error_wait).max(10.0) as u64;
        Self {
            rotate_interval_secs,
            rotated_at: now(),
            current: HashMap::new(),
            previous: HashMap::new(),
        }
    }

    fn maybe_rotate(&mut self) {
        if now() - self.rotated_at >= self.rotate_interval_secs as i64 {
            self.previous = std::mem::take(&mut self.current);
            self.rotated_at = now();
        }
    }

    pub fn record(&mut self, id: u32, token: DeviceToken) {
        self.maybe_rotate();
        self.current.insert(id, token);
    }

    pub fn lookup(&mut self, id: u32) -> Option<DeviceToken> {
        self.maybe_rotate();
        self.current.get(&id).or_else(|| self.previous.get(&id)).copied()
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}
