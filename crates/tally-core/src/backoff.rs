//! # Delivery Backoff
//!
//! Pure arithmetic for retry scheduling and flush diagnostics.
//!
//! ## Backoff Schedule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Backoff after consecutive failures                   │
//! │                                                                         │
//! │  failures before this one │ base delay │ with server hint h            │
//! │  ─────────────────────────┼────────────┼──────────────────────────     │
//! │            0              │    60 s    │ max(60 s, h)                   │
//! │            1              │   120 s    │ max(120 s, h)                  │
//! │            2              │   240 s    │ max(240 s, h)                  │
//! │            3              │   480 s    │ max(480 s, h)                  │
//! │           4+              │   600 s    │ 600 s (cap always wins)        │
//! │                                                                         │
//! │  Any success resets the failure count to zero.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

/// Delay after the first failure.
pub const BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Upper bound for any backoff, server hint included.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// Computes the delay before the next delivery attempt.
///
/// `failures` is the number of consecutive failures recorded before the
/// current one. The server hint can only lengthen the delay.
pub fn delivery_backoff(failures: u32, server_hint: Option<Duration>) -> Duration {
    let base = 2u32
        .checked_pow(failures)
        .and_then(|factor| BACKOFF_BASE.checked_mul(factor))
        .unwrap_or(MAX_BACKOFF);

    let delay = match server_hint {
        Some(hint) => base.max(hint),
        None => base,
    };

    delay.min(MAX_BACKOFF)
}

// =============================================================================
// Retry State
// =============================================================================

/// Consecutive-failure bookkeeping for the delivery loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive failed delivery runs.
    pub failures: u32,

    /// Delay chosen after the most recent failure.
    pub last_backoff: Option<Duration>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.last_backoff = None;
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn record_failure(&mut self, server_hint: Option<Duration>) -> Duration {
        let delay = delivery_backoff(self.failures, server_hint);
        self.failures = self.failures.saturating_add(1);
        self.last_backoff = Some(delay);
        delay
    }

    /// True while a failed run is waiting for its retry.
    pub fn backoff_pending(&self) -> bool {
        self.failures > 0
    }
}

// =============================================================================
// Flush Frequency
// =============================================================================

/// Running average of the time between flushes.
///
/// Diagnostic only: the flush interval itself never changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushFrequency {
    pub count: u64,
    pub average_ms: i64,
    pub last_flush_ms: i64,
}

impl FlushFrequency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a flush at `now_ms` and returns the updated average, if any.
    pub fn record(&mut self, now_ms: i64) -> Option<Duration> {
        let new_count = self.count.saturating_add(1);
        let mut average = None;

        if self.last_flush_ms > 0 {
            let interval = now_ms.saturating_sub(self.last_flush_ms);
            let total = interval.saturating_add(self.average_ms.saturating_mul(self.count as i64));
            self.average_ms = total / new_count as i64;
            average = Some(Duration::from_millis(self.average_ms.max(0) as u64));
        }

        self.last_flush_ms = now_ms;
        self.count = new_count;
        average
    }
}
