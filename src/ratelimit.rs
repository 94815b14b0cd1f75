//! Rate limiting for repetitive diagnostics.
//!
//! TLS and socket failures can be extremely chatty (a misconfigured peer
//! reconnecting in a tight loop produces an error per poll iteration), so
//! engine-level diagnostics are throttled through a token bucket: a burst of
//! messages passes, then a steady trickle per interval, and everything else
//! is counted rather than printed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const INTERVAL: Duration = Duration::from_secs(60);

/// Token-bucket throttle for log messages.
///
/// `burst` messages are admitted back to back; afterwards `per_interval`
/// tokens are replenished per 60-second interval. Suppressed messages are
/// counted and the count is handed to the next admitted caller so it can be
/// reported.
#[derive(Debug)]
pub struct RateLimit {
    burst: u32,
    per_interval: u32,
    interval: Duration,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: u32,
    dropped: u64,
    last_refill: Option<Instant>,
}

impl RateLimit {
    /// Creates a limiter admitting `burst` messages immediately and
    /// `per_interval` per minute thereafter.
    #[must_use]
    pub fn new(burst: u32, per_interval: u32) -> Self {
        Self::with_interval(burst, per_interval, INTERVAL)
    }

    fn with_interval(burst: u32, per_interval: u32, interval: Duration) -> Self {
        Self {
            burst,
            per_interval,
            interval,
            state: Mutex::new(State {
                tokens: burst,
                dropped: 0,
                last_refill: None,
            }),
        }
    }

    /// Returns `Some(dropped)` when the caller may log, where `dropped` is
    /// the number of messages suppressed since the last admitted one, or
    /// `None` when this message should be dropped.
    pub fn admit(&self) -> Option<u64> {
        let mut state = self.state.lock().expect("rate limit lock poisoned");
        let now = Instant::now();
        let cap = self.burst.max(self.per_interval);

        match state.last_refill {
            None => state.last_refill = Some(now),
            Some(last) => {
                let intervals = now.duration_since(last).as_nanos() / self.interval.as_nanos().max(1);
                if intervals > 0 {
                    let refill = u32::try_from(intervals)
                        .unwrap_or(u32::MAX)
                        .saturating_mul(self.per_interval);
                    state.tokens = state.tokens.saturating_add(refill).min(cap);
                    state.last_refill = Some(now);
                }
            }
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            Some(std::mem::take(&mut state.dropped))
        } else {
            state.dropped += 1;
            None
        }
    }
}

/// Logs through a [`RateLimit`], reporting the suppressed-message count when
/// a quiet period ends.
macro_rules! rate_limited {
    ($rl:expr, $level:ident, $($arg:tt)*) => {
        if let Some(dropped) = $rl.admit() {
            if dropped > 0 {
                tracing::$level!(dropped, "rate limiting resumed, messages were dropped");
            }
            tracing::$level!($($arg)*);
        }
    };
}
pub(crate) use rate_limited;
