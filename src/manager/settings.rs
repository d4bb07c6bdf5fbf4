//! Configuration for [`ChannelManager`](super::ChannelManager).
use crate::dispatcher::DEFAULT_SUBSCRIBER_CAPACITY;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

/// How long to wait before each reconnection attempt.
///
/// Reconnection attempts are unbounded, whatever the strategy: the manager keeps trying until it
/// succeeds or it is closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectStrategy {
    /// Wait the same amount of time before every attempt.
    FixedInterval(Duration),
    /// Wait `first × factor^attempt`, capped at `max`.
    Exponential {
        first: Duration,
        max: Duration,
        factor: f64,
    },
}

impl ReconnectStrategy {
    /// The delay to observe before the given attempt (0-indexed) within a recovery cycle.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::FixedInterval(interval) => interval,
            Self::Exponential { first, max, factor } => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                let secs = first.as_secs_f64() * factor.powi(exponent);
                if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::FixedInterval(Duration::from_secs(DEFAULT_RECONNECT_INTERVAL_SECONDS))
    }
}

const DEFAULT_RECONNECT_INTERVAL_SECONDS: u64 = 5;
const MIN_RECONNECT_INTERVAL_MS: u64 = 1;

#[derive(Debug, Deserialize, Clone, PartialEq)]
/// Settings to build a [`ChannelManager`](super::ChannelManager).
///
/// You can use `ChannelManagerSettings::default()` to reconnect every 5 seconds, forever.
pub struct ChannelManagerSettings {
    /// How long to wait before each reconnection attempt, in milliseconds.
    #[serde(
        default = "default_reconnect_interval_ms",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub reconnect_interval_ms: u64,
    /// Grow the delay between attempts exponentially instead of keeping it fixed.
    /// `reconnect_interval_ms` is used as the initial delay.
    #[serde(default)]
    pub backoff: Option<BackoffSettings>,
    /// How many undelivered recovery notifications each subscriber can buffer.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
/// Exponential backoff between reconnection attempts.
pub struct BackoffSettings {
    /// Upper bound for the delay between two attempts, in milliseconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_interval_ms: u64,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
}

impl Default for ChannelManagerSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
            backoff: None,
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl ChannelManagerSettings {
    /// Fixed-interval reconnection, every `interval`.
    ///
    /// The interval has millisecond granularity: it is rounded down, with a floor of 1ms.
    pub fn with_reconnect_interval(interval: Duration) -> Self {
        Self {
            reconnect_interval_ms: u64::try_from(interval.as_millis())
                .unwrap_or(u64::MAX)
                .max(MIN_RECONNECT_INTERVAL_MS),
            ..Self::default()
        }
    }

    /// The strategy described by these settings.
    ///
    /// An interval of 0ms is treated as 1ms: the manager never retries in a busy loop.
    pub fn reconnect_strategy(&self) -> ReconnectStrategy {
        let interval =
            Duration::from_millis(self.reconnect_interval_ms.max(MIN_RECONNECT_INTERVAL_MS));
        match &self.backoff {
            None => ReconnectStrategy::FixedInterval(interval),
            Some(backoff) => ReconnectStrategy::Exponential {
                first: interval,
                max: Duration::from_millis(backoff.max_interval_ms).max(interval),
                factor: backoff.factor,
            },
        }
    }
}

fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_SECONDS * 1000
}

fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}
