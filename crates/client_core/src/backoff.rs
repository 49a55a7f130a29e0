use std::time::Duration;

/// Consecutive failed attempts are counted up to this value and no further.
pub const RECONNECT_ATTEMPT_CAP: u32 = 8;

/// Exponential reconnect delay: `min(max_delay, base * 2^(attempt - 1))`,
/// with the attempt clamped to `attempt_cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    attempt_cap: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, attempt_cap: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            attempt_cap: attempt_cap.max(1),
        }
    }

    pub fn attempt_cap(&self) -> u32 {
        self.attempt_cap
    }

    /// Attempt 0 is treated as the first attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.clamp(1, self.attempt_cap);
        let multiplier = 1_u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(1_000),
            Duration::from_millis(20_000),
            RECONNECT_ATTEMPT_CAP,
        )
    }
}

/// Consecutive unexpected closes since the last successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectCounter {
    attempt: u32,
    cap: u32,
}

impl ReconnectCounter {
    pub fn new(cap: u32) -> Self {
        Self {
            attempt: 0,
            cap: cap.max(1),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn bump(&mut self) -> u32 {
        self.attempt = (self.attempt + 1).min(self.cap);
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
