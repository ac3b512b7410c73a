//! Rate limiter persisted after every mutation.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::rate_limit::{RateLimitCounters, RateLimiter, WarningLevel};
use crate::io::atomic::{load_json_or_default, write_json_atomic};
use crate::io::paths::ProjectPaths;

/// [`RateLimiter`] bound to `rate_limit.json`.
#[derive(Debug, Clone)]
pub struct TrackedRateLimiter {
    path: PathBuf,
    limiter: RateLimiter,
}

impl TrackedRateLimiter {
    /// Load counters; a missing or corrupted file starts a fresh window.
    pub fn load(paths: &ProjectPaths, max_calls: u32) -> Self {
        let counters: RateLimitCounters =
            load_json_or_default(&paths.rate_limit, "rate limit counters");
        Self {
            path: paths.rate_limit.clone(),
            limiter: RateLimiter::new(counters, max_calls),
        }
    }

    pub fn counters(&self) -> &RateLimitCounters {
        self.limiter.counters()
    }

    pub fn max_calls(&self) -> u32 {
        self.limiter.max_calls()
    }

    /// Roll the window over if due, persisting when it changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.limiter.refresh(now) {
            debug!("rate limit window started");
            self.save()?;
        }
        Ok(())
    }

    pub fn remaining(&mut self, now: DateTime<Utc>) -> Result<u32> {
        self.refresh(now)?;
        Ok(self.limiter.remaining(now))
    }

    pub fn is_exhausted(&mut self, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.remaining(now)? == 0)
    }

    pub fn seconds_until_reset(&self, now: DateTime<Utc>) -> u64 {
        self.limiter.seconds_until_reset(now)
    }

    /// Count one invocation and log a budget warning the first time a level is crossed.
    pub fn record_call(&mut self, now: DateTime<Utc>) -> Result<Option<WarningLevel>> {
        self.limiter.record_call(now);
        let warning = self.limiter.take_warning(now);
        self.save()?;
        let remaining = self.limiter.remaining(now);
        match warning {
            Some(WarningLevel::Critical) => {
                warn!(remaining, max_calls = self.max_calls(), "rate limit budget critical");
            }
            Some(WarningLevel::Warning) => {
                warn!(remaining, max_calls = self.max_calls(), "rate limit budget low");
            }
            _ => info!(remaining, max_calls = self.max_calls(), "invocation counted"),
        }
        Ok(warning)
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, self.limiter.counters())
    }
}
