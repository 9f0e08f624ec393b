//! Adaptive, jittered pacing for calls against the chat service.
//!
//! The multiplier is the single piece of shared state: errors push it up
//! (429s harder than anything else), successes relax it back down
//! gradually, and a rate-limit pause halves it but never below a cautious
//! floor.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MULTIPLIER_FLOOR: f64 = 1.0;
const MULTIPLIER_CEILING: f64 = 20.0;
const NORMAL_ERROR_CEILING: f64 = 10.0;
const RATE_LIMIT_MULTIPLIER_FACTOR: f64 = 3.0;
const RATE_LIMIT_PAUSE_FLOOR: f64 = 2.0;
const RECOVERY_FACTOR: f64 = 0.9;
const MIN_DELAY_SECS: f64 = 0.5;
const JITTER_RANGE_SECS: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct ThrottlerConfig {
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff_multiplier: f64,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self { min_delay_secs: 1.5, max_delay_secs: 4.2, backoff_multiplier: 1.5 }
    }
}

#[derive(Debug, Default)]
struct ThrottlerState {
    current_multiplier: f64,
    consecutive_errors: u32,
}

/// Wait was interrupted by cancellation before its delay elapsed.
#[derive(Debug, thiserror::Error)]
#[error("throttler wait cancelled")]
pub struct Cancelled;

pub struct Throttler {
    config: ThrottlerConfig,
    state: Mutex<ThrottlerState>,
}

impl Throttler {
    #[must_use]
    pub fn new(config: ThrottlerConfig) -> Self {
        Self { config, state: Mutex::new(ThrottlerState { current_multiplier: 1.0, consecutive_errors: 0 }) }
    }

    #[must_use]
    pub fn current_multiplier(&self) -> f64 {
        self.state.lock().current_multiplier
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    /// `max(0.5, base * currentMultiplier + micro)`, `base` uniform in
    /// `[minDelay, maxDelay]`, `micro` uniform in `[-0.2, 0.2]`.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let multiplier = self.state.lock().current_multiplier;
        let mut rng = rand::thread_rng();
        let base = rng.gen_range(self.config.min_delay_secs..=self.config.max_delay_secs);
        let micro = rng.gen_range(-JITTER_RANGE_SECS..=JITTER_RANGE_SECS);
        let secs = (base * multiplier + micro).max(MIN_DELAY_SECS);
        Duration::from_secs_f64(secs)
    }

    /// Sleep for [`Self::next_delay`], aborting early if `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let delay = self.next_delay();
        tokio::select! {
            () = cancel.cancelled() => Err(Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// `status = Some(429)` pushes the multiplier up to 3x (ceiling 20.0);
    /// any other error applies the configured backoff multiplier (ceiling
    /// 10.0). The asymmetry lets a rate-limit response push higher than a
    /// plain transport error ever can.
    pub fn register_error(&self, status: Option<u16>) {
        let mut state = self.state.lock();
        state.consecutive_errors += 1;
        if status == Some(429) {
            state.current_multiplier = (state.current_multiplier * RATE_LIMIT_MULTIPLIER_FACTOR).min(MULTIPLIER_CEILING);
        } else {
            state.current_multiplier =
                (state.current_multiplier * self.config.backoff_multiplier).min(NORMAL_ERROR_CEILING);
        }
    }

    /// Resets the error streak; relaxes the multiplier by 10% per call,
    /// never below 1.0. Gradual so a single success after a storm does not
    /// immediately return to full speed.
    pub fn register_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_errors = 0;
        if state.current_multiplier > MULTIPLIER_FLOOR {
            state.current_multiplier = (state.current_multiplier * RECOVERY_FACTOR).max(MULTIPLIER_FLOOR);
        }
    }

    /// Unconditional sleep of `seconds`, then halve the multiplier down to a
    /// floor of 2.0, a deliberately cautious floor, not all the way to 1.0.
    pub async fn rate_limit_pause(&self, seconds: f64, cancel: &CancellationToken) -> Result<(), Cancelled> {
        warn!(seconds, "rate limited, pausing");
        tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled),
            () = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        }
        let mut state = self.state.lock();
        state.current_multiplier = (state.current_multiplier / 2.0).max(RATE_LIMIT_PAUSE_FLOOR);
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn multiplier_stays_in_bounds(ops in prop::collection::vec(0u8..3, 0..200)) {
            let t = Throttler::new(ThrottlerConfig::default());
            for op in ops {
                match op {
                    0 => t.register_error(Some(429)),
                    1 => t.register_error(None),
                    _ => t.register_success(),
                }
                let m = t.current_multiplier();
                prop_assert!((1.0..=20.0).contains(&m));
            }
        }
    }
}
