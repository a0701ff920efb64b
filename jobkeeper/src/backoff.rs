//! Retry delays for failed jobs, see [`crate::registry::Processor::backoff`].
//!
//! A [`BackoffStrategy`] turns the number of the attempt that just failed into the delay before
//! the job is tried again. It follows either a constant or an exponential curve, which can be
//! capped, randomised with [`Jitter`] and given a floor, in that order.
//!
//! # Example
//!
//! ```
//! # use jobkeeper::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(5)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(5));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(15));
//! // The cap applies before the jitter.
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(65));
//! ```
use chrono::TimeDelta;
use rand::Rng;

/// Computes the delay before retrying a job whose attempt number `attempt` just failed.
///
/// Implemented by [`BackoffStrategy`] and by any `Fn(u16) -> TimeDelta`.
pub trait Strategy {
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

impl<F> Strategy for F
where
    F: Fn(u16) -> TimeDelta,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        self(attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Constant(TimeDelta),
    /// `base × 2^(attempt − 1)`, saturating.
    Exponential(TimeDelta),
}

impl Curve {
    fn at(&self, attempt: u16) -> TimeDelta {
        match *self {
            Self::Constant(delay) => delay,
            Self::Exponential(base) => {
                let doublings = u32::from(attempt.saturating_sub(1));
                2_i64
                    .checked_pow(doublings)
                    .and_then(|factor| base.num_milliseconds().checked_mul(factor))
                    .and_then(TimeDelta::try_milliseconds)
                    .unwrap_or(TimeDelta::MAX)
            }
        }
    }
}

/// Random noise added to a delay so that jobs failing together are not retried together.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Up to the given delta either side of the delay.
    Absolute(TimeDelta),
    /// Up to the given fraction of the delay either side of it, e.g. `0.1` for ±10%.
    Relative(f64),
}

impl Jitter {
    fn spread_ms(&self, delay: TimeDelta) -> i64 {
        match *self {
            Self::Absolute(delta) => delta.num_milliseconds().saturating_abs(),
            Self::Relative(fraction) => {
                (delay.num_milliseconds() as f64 * fraction.abs()).round() as i64
            }
        }
    }

    fn apply(&self, delay: TimeDelta) -> TimeDelta {
        let spread = self.spread_ms(delay);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(delay)
    }
}

/// A retry delay curve with an optional cap, jitter and floor.
///
/// ```
/// # use jobkeeper::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// let delays: Vec<_> = (1..=5).map(|attempt| strategy.backoff(attempt).num_seconds()).collect();
/// assert_eq!(delays, vec![2, 4, 8, 16, 30]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    curve: Curve,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy {
    const fn from_curve(curve: Curve) -> Self {
        Self {
            curve,
            max: None,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Waits `delay` after every attempt.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::from_curve(Curve::Constant(delay))
    }

    /// Waits `base` after the first attempt and doubles the delay after each further one.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::from_curve(Curve::Exponential(base))
    }

    /// Caps the delay, before any jitter is applied.
    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    pub const fn with_jitter(self, jitter: Jitter) -> Self {
        Self {
            jitter: Some(jitter),
            ..self
        }
    }

    /// The smallest delay returned, applied last. Keeps a large jitter from retrying at once.
    pub const fn with_min(self, min: TimeDelta) -> Self {
        Self { min, ..self }
    }
}

impl Strategy for BackoffStrategy {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut delay = self.curve.at(attempt);
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        if let Some(jitter) = &self.jitter {
            delay = jitter.apply(delay);
        }
        delay.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_ignores_the_attempt() {
        let strategy = BackoffStrategy::constant(TimeDelta::minutes(1));

        assert!((1..50).all(|attempt| strategy.backoff(attempt) == TimeDelta::minutes(1)));
    }

    #[test]
    fn default_retry_delays_double() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));

        let delays: Vec<_> = (1..=4).map(|attempt| strategy.backoff(attempt)).collect();

        assert_eq!(
            delays,
            vec![
                TimeDelta::seconds(1),
                TimeDelta::seconds(2),
                TimeDelta::seconds(4),
                TimeDelta::seconds(8)
            ]
        );
    }

    #[test]
    fn consecutive_gaps_at_least_double() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(250));

        for attempt in 2..30 {
            let previous = strategy.backoff(attempt - 1);
            let next = strategy.backoff(attempt);
            assert!(next >= previous * 2 || next == TimeDelta::MAX, "attempt {attempt}");
        }
    }

    #[test]
    fn attempt_zero_counts_as_the_first() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(3));

        assert_eq!(strategy.backoff(0), strategy.backoff(1));
    }

    #[test]
    fn exponential_saturates() {
        let uncapped = BackoffStrategy::exponential(TimeDelta::days(1));
        let capped = uncapped.with_max(TimeDelta::hours(1));

        assert_eq!(uncapped.backoff(u16::MAX), TimeDelta::MAX);
        assert_eq!(capped.backoff(u16::MAX), TimeDelta::hours(1));
    }

    #[test]
    fn email_retry_schedule_stays_within_jitter() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(30))
            .with_max(TimeDelta::hours(1))
            .with_jitter(Jitter::Relative(0.1));

        for (attempt, expected) in [(1, 30), (2, 60), (3, 120), (10, 3600)] {
            let delay = strategy.backoff(attempt).num_milliseconds() as f64;
            let expected = (expected * 1000) as f64;
            assert!(delay >= expected * 0.9 && delay <= expected * 1.1, "attempt {attempt}");
        }
    }

    #[test]
    fn absolute_jitter_respects_the_floor() {
        let strategy = BackoffStrategy::constant(TimeDelta::seconds(2))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)))
            .with_min(TimeDelta::seconds(1));

        for attempt in 1..50 {
            let delay = strategy.backoff(attempt);
            assert!(delay >= TimeDelta::seconds(1));
            assert!(delay <= TimeDelta::seconds(12));
        }
    }

    #[test]
    fn closures_are_strategies() {
        let linear = |attempt: u16| TimeDelta::seconds(i64::from(attempt) * 5);

        assert_eq!(linear.backoff(3), TimeDelta::seconds(15));
    }
}
