use super::types::CloseReason;
use std::time::Duration;

/// What to do after an unintentional close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule the next attempt after this delay.
    Reconnect(Duration),
    GiveUp,
}

/// Exponential backoff with a bounded number of attempts.
///
/// Attempt `n` (1-based) waits `base * 2^(n-1)`; with the defaults that is
/// 2s, 4s, 8s, 16s, 32s and then the session is closed for good. A
/// logged-out close is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// `attempts_made` counts reconnects already scheduled since the session
    /// was last open.
    pub fn decide(&self, reason: &CloseReason, attempts_made: u32) -> ReconnectDecision {
        if reason.is_logged_out() || attempts_made >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        ReconnectDecision::Reconnect(self.delay_for(attempts_made + 1))
    }

    /// Delay before 1-based attempt `attempt`. Saturates instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}
