//! Log de-duplication for messages that would otherwise repeat on every flush.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use quanta::{Clock, Instant};
use tracing::{debug, error, info, trace, warn, Level};

/// Number of keys after which stale entries are pruned.
const MAX_TRACKED_KEYS: usize = 1000;

/// Emits each distinct message (or message key) at most once per window.
///
/// A backend that keeps rejecting data, or a buffer that stays full, would otherwise log on
/// every record or every flush tick.
pub struct MessageDedupingLogger {
    clock: Clock,
    window: Duration,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl MessageDedupingLogger {
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Clock::new())
    }

    pub(crate) fn with_clock(window: Duration, clock: Clock) -> Self {
        Self {
            clock,
            window,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Logs `message`, keyed by the message itself. Returns whether it was emitted.
    pub fn log(&self, level: Level, message: &str) -> bool {
        self.log_with_alternate_key(level, message, message)
    }

    /// Logs `message`, de-duplicating on `key` instead of the message text.
    ///
    /// Useful when the message embeds a varying count, e.g. "dropping 12 spans".
    pub fn log_with_alternate_key(&self, level: Level, message: &str, key: &str) -> bool {
        if !self.acquire(key) {
            return false;
        }
        match level {
            Level::ERROR => error!("{}", message),
            Level::WARN => warn!("{}", message),
            Level::INFO => info!("{}", message),
            Level::DEBUG => debug!("{}", message),
            _ => trace!("{}", message),
        }
        true
    }

    fn acquire(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut last_emitted = self
            .last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = last_emitted.get_mut(key) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
            *last = now;
            return true;
        }

        if last_emitted.len() >= MAX_TRACKED_KEYS {
            let window = self.window;
            last_emitted.retain(|_, last| now.saturating_duration_since(*last) < window);
        }
        last_emitted.insert(key.to_string(), now);
        true
    }
}
