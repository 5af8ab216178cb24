use std::time::Duration;

/// Base delay between connection attempts to the coordination service.
pub const CONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Connection retries after the first attempt before giving up.
pub const CONNECT_MAX_RETRIES: u32 = 3;

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`, optionally
/// limited to `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
}

impl Backoff {
    pub const fn bounded(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay: Duration::MAX,
            max_retries: Some(max_retries),
        }
    }

    pub const fn capped(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            max_retries: None,
        }
    }

    /// Policy used when opening the coordination session.
    pub const fn connect_policy() -> Self {
        Self::bounded(CONNECT_BASE_DELAY, CONNECT_MAX_RETRIES)
    }

    /// Policy used between failed lock attempts; never gives up.
    pub const fn lock_wait_policy() -> Self {
        Self::capped(Duration::from_millis(100), Duration::from_secs(5))
    }

    /// Delay before retry number `attempt` (0-based), or `None` once the
    /// retry budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if attempt >= max {
                return None;
            }
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max_delay))
    }
}
