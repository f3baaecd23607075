//! Leading-edge rate limiter for position writes

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Default minimum interval between accepted writes
pub const DEFAULT_LOCATION_WINDOW: Duration = Duration::from_secs(10);

/// Accepts the first sample of each window per user and drops the rest.
///
/// A window opens at the accepted sample, so the accepted sample is always
/// the newest one available when the write happens. Nothing is queued.
/// Windows are keyed by user id and outlive any single feed: a device that
/// reconnects lands in the window its previous feed opened.
#[derive(Debug)]
pub struct LocationThrottle {
    window: Duration,
    last_accepted: DashMap<String, Instant>,
}

impl LocationThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Offer a sample for `user_id` arriving at `now`; true if it should be written
    pub fn offer(&self, user_id: &str, now: Instant) -> bool {
        match self.last_accepted.entry(user_id.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) >= self.window {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time until the next sample for `user_id` would be accepted
    pub fn remaining(&self, user_id: &str, now: Instant) -> Duration {
        match self.last_accepted.get(user_id) {
            None => Duration::ZERO,
            Some(last) => self.window.saturating_sub(now.saturating_duration_since(*last)),
        }
    }

    /// Forget windows that have already elapsed
    pub fn cleanup(&self, now: Instant) {
        let window = self.window;
        self.last_accepted
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    /// Users with an open window
    pub fn tracked(&self) -> usize {
        self.last_accepted.len()
    }
}

impl Default for LocationThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATION_WINDOW)
    }
}
