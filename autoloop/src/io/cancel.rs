//! Cancellation token shared between the Ctrl-C handler and the loop.
//!
//! Every blocking point (subprocess wait, retry backoff, rate-limit wait) polls
//! or waits on the token, so an interrupt is observed within a bounded delay.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::info;

/// Clonable cancellation flag with a condition variable for interruptible waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

/// How an interruptible wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless cancelled first.
    pub fn wait(&self, duration: Duration) -> WaitOutcome {
        let deadline = Instant::now() + duration;
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *cancelled {
                return WaitOutcome::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Elapsed;
            }
            let (guard, _) = cvar
                .wait_timeout(cancelled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            cancelled = guard;
        }
    }

    /// Sleep for `total`, calling `on_tick` with the remaining time before each
    /// `tick`-sized slice.
    pub fn wait_with_countdown(
        &self,
        total: Duration,
        tick: Duration,
        mut on_tick: impl FnMut(Duration),
    ) -> WaitOutcome {
        let deadline = Instant::now() + total;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::Elapsed;
            }
            on_tick(remaining);
            if self.wait(remaining.min(tick)) == WaitOutcome::Cancelled {
                return WaitOutcome::Cancelled;
            }
        }
    }

    /// Cancel this token on Ctrl-C.
    pub fn install_ctrlc_handler(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            info!("received Ctrl+C, stopping after cleanup");
            token.cancel();
            eprintln!();
        })
        .context("failed to set Ctrl+C handler")?;
        Ok(())
    }
}
