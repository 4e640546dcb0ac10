// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`tracing`] macros that are rate limited per call site.
//!
//! Use these for events a guest can trigger at will, such as a malformed
//! descriptor chain. Each call site gets its own limiter, so a flood from one
//! source cannot drown out other events.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;
#[doc(hidden)]
pub use tracing;

const PERIOD_MS: u32 = 5000;
const EVENTS_PER_PERIOD: u32 = 10;

static DISABLE_RATE_LIMITING: AtomicBool = AtomicBool::new(false);

/// Disables or reenables rate limiting globally.
///
/// Rate limiting defaults to enabled.
pub fn disable_rate_limiting(disabled: bool) {
    DISABLE_RATE_LIMITING.store(disabled, Ordering::Relaxed);
}

#[doc(hidden)]
pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    period_ms: u32,
    events_per_period: u32,
    start: Option<Instant>,
    events: u32,
    missed: u64,
}

#[doc(hidden)]
#[derive(Debug)]
pub struct RateLimited;

impl RateLimiter {
    pub const fn new_default() -> Self {
        Self::new(PERIOD_MS, EVENTS_PER_PERIOD)
    }

    pub const fn new(period_ms: u32, events_per_period: u32) -> Self {
        Self {
            state: Mutex::new(RateLimiterState {
                period_ms,
                events_per_period,
                start: None,
                events: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Ok(missed_events)` if this event should be logged.
    ///
    /// `missed_events` is `Some(n)` if events were dropped since the last
    /// logged one, or if this event is the last one before limiting starts.
    pub fn event(&self) -> Result<Option<u64>, RateLimited> {
        self.event_at(Instant::now())
    }

    fn event_at(&self, now: Instant) -> Result<Option<u64>, RateLimited> {
        if DISABLE_RATE_LIMITING.load(Ordering::Relaxed) {
            return Ok(None);
        }

        // Contention means another thread is logging the same event right now.
        let mut state = self.state.try_lock().ok_or(RateLimited)?;
        let period_ms = state.period_ms;
        let start = state.start.get_or_insert(now);
        if now.duration_since(*start).as_millis() > period_ms as u128 {
            *start = now;
            state.events = 0;
        }
        if state.events >= state.events_per_period {
            state.missed += 1;
            return Err(RateLimited);
        }
        state.events += 1;
        let missed = std::mem::take(&mut state.missed);
        Ok((missed != 0 || state.events == state.events_per_period).then_some(missed))
    }
}

/// As [`tracing::error!`], but rate limited.
#[macro_export]
macro_rules! error_ratelimited {
    ($($rest:tt)*) => {
        {
            static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new_default();
            if let Ok(missed_events) = RATE_LIMITER.event() {
                $crate::tracing::error!(dropped_ratelimited = missed_events, $($rest)*);
            }
        }
    };
}

/// As [`tracing::warn!`], but rate limited.
#[macro_export]
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {
        {
            static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new_default();
            if let Ok(missed_events) = RATE_LIMITER.event() {
                $crate::tracing::warn!(dropped_ratelimited = missed_events, $($rest)*);
            }
        }
    };
}
