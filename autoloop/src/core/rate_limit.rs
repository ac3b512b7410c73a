//! Hourly invocation budget.
//!
//! The window is evaluated lazily: every operation takes the current time and
//! rolls the window over first when an hour has passed since `window_start`.
//! There is no background timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of one budget window in seconds.
pub const WINDOW_SECS: i64 = 3600;

/// Budget warning level. Ordered so a level can only escalate within a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    #[default]
    None,
    /// At most 20% of the budget remains.
    Warning,
    /// At most 5% of the budget remains.
    Critical,
}

/// Persisted counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitCounters {
    pub call_count: u32,
    /// Unix seconds.
    pub window_start: i64,
    pub last_warned: WarningLevel,
}

/// Rate limiter over [`RateLimitCounters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiter {
    counters: RateLimitCounters,
    max_calls: u32,
}

impl RateLimiter {
    pub fn new(counters: RateLimitCounters, max_calls: u32) -> Self {
        Self {
            counters,
            max_calls,
        }
    }

    pub fn counters(&self) -> &RateLimitCounters {
        &self.counters
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    /// Roll the window over if an hour has elapsed. Returns true when the
    /// counters changed and need persisting.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        let now = now.timestamp();
        if self.counters.window_start == 0 {
            self.counters.window_start = now;
            return true;
        }
        if now - self.counters.window_start >= WINDOW_SECS {
            self.counters = RateLimitCounters {
                call_count: 0,
                window_start: now,
                last_warned: WarningLevel::None,
            };
            return true;
        }
        false
    }

    /// Count one invocation.
    pub fn record_call(&mut self, now: DateTime<Utc>) {
        self.refresh(now);
        self.counters.call_count = self.counters.call_count.saturating_add(1);
    }

    pub fn remaining(&mut self, now: DateTime<Utc>) -> u32 {
        self.refresh(now);
        self.max_calls.saturating_sub(self.counters.call_count)
    }

    pub fn is_exhausted(&mut self, now: DateTime<Utc>) -> bool {
        self.remaining(now) == 0
    }

    /// Seconds until the current window rolls over.
    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        let elapsed = now.timestamp() - self.counters.window_start;
        (WINDOW_SECS - elapsed).max(0) as u64
    }

    /// Return a warning level the first time the budget crosses it.
    ///
    /// Each level fires at most once per window and never at or below the
    /// level already reported.
    pub fn take_warning(&mut self, now: DateTime<Utc>) -> Option<WarningLevel> {
        let remaining = self.remaining(now);
        let level = warning_level(remaining, self.max_calls);
        if level > self.counters.last_warned {
            self.counters.last_warned = level;
            return Some(level);
        }
        None
    }
}

/// Level for `remaining` out of `max_calls`.
pub fn warning_level(remaining: u32, max_calls: u32) -> WarningLevel {
    if max_calls == 0 {
        return WarningLevel::Critical;
    }
    let remaining = remaining as u64 * 100;
    let max = max_calls as u64;
    if remaining <= max * 5 {
        WarningLevel::Critical
    } else if remaining <= max * 20 {
        WarningLevel::Warning
    } else {
        WarningLevel::None
    }
}
