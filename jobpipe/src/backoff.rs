//! Backoff strategies used between retried attempts.
//!
//! The same strategies drive two separate retry layers:
//!
//! 1. [`crate::action::wrapper::RetryWrapper`] waits between attempts of a single action, and
//! 2. [`crate::runtime::memory::MemoryQueue`] waits before redelivering a failed job.
//!
//! This module provides four main backoff strategies:
//!
//! 1. Constant
//! 2. Linear
//! 3. Polynomial
//! 4. Exponential
//!
//! each which can be optionally modified by applying different types of jitter.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use jobpipe::prelude::*;
//! # use std::time::Duration;
//! let strategy = BackoffStrategy::linear(Duration::from_millis(200))
//!     .with_max(Duration::from_millis(600))
//!     .with_jitter(Jitter::Absolute(Duration::from_millis(100)));
//!
//! assert!(strategy.backoff(1) >= Duration::from_millis(100));
//! assert!(strategy.backoff(1) <= Duration::from_millis(300));
//! // Note the max here is the max plus max jitter
//! assert!(strategy.backoff(10) <= Duration::from_millis(700));
//! ```

use std::time::Duration;

use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given an attempt number (starting at 1) returns the [`Duration`] to wait before the next
    /// attempt.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Constant backoff strategy.
///
/// Always returns the same value no matter what the attempt is.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::constant`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: Duration,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// Doubles with each attempt starting from `base`. It is advisable to set the maximum backoff
/// using [`BackoffStrategy::with_max`].
///
/// # Example
///
/// ```
/// # use jobpipe::prelude::*;
/// # use std::time::Duration;
/// let strategy = BackoffStrategy::exponential(Duration::from_millis(100))
///     .with_max(Duration::from_millis(500));
///
/// assert_eq!(strategy.backoff(1), Duration::from_millis(100));
/// assert_eq!(strategy.backoff(2), Duration::from_millis(200));
/// assert_eq!(strategy.backoff(3), Duration::from_millis(400));
/// assert_eq!(strategy.backoff(4), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: Duration,
    max: Option<Duration>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let backoff = self.base.checked_mul(factor).unwrap_or(Duration::MAX);
        clamp(backoff, self.max)
    }
}

/// Linear backoff strategy.
///
/// Grows linear with each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: Duration,
    max: Option<Duration>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u32) -> Duration {
        let backoff = self.factor.checked_mul(attempt).unwrap_or(Duration::MAX);
        clamp(backoff, self.max)
    }
}

/// Polynomial backoff strategy.
///
/// Grows as `factor * attempt^power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polynomial {
    factor: Duration,
    power: u32,
    max: Option<Duration>,
}

impl Strategy for Polynomial {
    fn backoff(&self, attempt: u32) -> Duration {
        let backoff = attempt
            .checked_pow(self.power)
            .and_then(|multiplier| self.factor.checked_mul(multiplier))
            .unwrap_or(Duration::MAX);
        clamp(backoff, self.max)
    }
}

fn clamp(backoff: Duration, max: Option<Duration>) -> Duration {
    match max {
        Some(max) => backoff.min(max),
        None => backoff,
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(Duration),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: Duration) -> Duration {
        let value_ms = i64::try_from(value.as_millis()).unwrap_or(i64::MAX);
        let milliseconds = match self {
            Self::Absolute(delta) => i64::try_from(delta.as_millis()).unwrap_or(i64::MAX),
            Self::Relative(ratio) => (value_ms as f64 * ratio).round().abs() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        Duration::from_millis(value_ms.saturating_add(jitter).max(0) as u64)
    }
}

/// A configured backoff strategy.
///
/// Wraps one of the base strategies ([`Constant`], [`Linear`], [`Polynomial`], [`Exponential`])
/// with an optional [`Jitter`] and a minimum delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: Duration,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] with a constant backoff strategy.
    ///
    /// ```
    /// # use jobpipe::prelude::*;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::constant(Duration::from_millis(10));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_millis(10));
    /// assert_eq!(strategy.backoff(7), Duration::from_millis(10));
    /// ```
    pub const fn constant(delay: Duration) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] with an exponential backoff strategy.
    pub const fn exponential(base: Duration) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Linear> {
    /// Creates a [`BackoffStrategy`] with a linear backoff strategy.
    ///
    /// ```
    /// # use jobpipe::prelude::*;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::linear(Duration::from_millis(10))
    ///     .with_max(Duration::from_millis(25));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_millis(10));
    /// assert_eq!(strategy.backoff(2), Duration::from_millis(20));
    /// assert_eq!(strategy.backoff(3), Duration::from_millis(25));
    /// ```
    pub const fn linear(factor: Duration) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Polynomial> {
    /// Creates a [`BackoffStrategy`] with a polynomial backoff strategy.
    pub const fn polynomial(factor: Duration, power: u32) -> Self {
        Self::new(Polynomial {
            factor,
            power,
            max: None,
        })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: Duration) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] with a the given backoff strategy.
    ///
    /// Generally this function will only be used if you have implemented your own custom
    /// [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: Duration::ZERO,
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. Useful with a large jitter to avoid a delay of less than a given
    /// amount.
    pub const fn with_min(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> Duration {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}
