// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Count Management
//!
//! This module decides how many concurrent subscriptions a queue consumer
//! should keep open. The decision is a pure function of the observed queue
//! depth; the consumer supplies the depth on every scaling tick and
//! reconciles its subscription set against the returned target.

use crate::errors::AmqpError;
use std::time::Duration;
use tracing::debug;

/// Configuration for the dynamic consumer count manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerCountManagerConfig {
    /// Lower bound on concurrent subscriptions while the pool is healthy
    pub min_concurrent_consumers: u32,
    /// Upper bound on concurrent subscriptions
    pub max_concurrent_consumers: u32,
    /// Queued messages one subscription is expected to absorb
    pub messages_per_consumer_ratio: u32,
    /// How often the consumer re-evaluates its scale
    pub auto_scale_interval: Duration,
}

impl Default for ConsumerCountManagerConfig {
    fn default() -> Self {
        ConsumerCountManagerConfig {
            min_concurrent_consumers: 1,
            max_concurrent_consumers: 10,
            messages_per_consumer_ratio: 10,
            auto_scale_interval: Duration::from_secs(10),
        }
    }
}

impl ConsumerCountManagerConfig {
    /// Checks the configuration invariants.
    ///
    /// `min ≤ max`, `ratio ≥ 1` and a non-zero interval are required; a
    /// violated invariant is a `ConfigError`.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.min_concurrent_consumers > self.max_concurrent_consumers {
            return Err(AmqpError::ConfigError(format!(
                "min_concurrent_consumers ({}) exceeds max_concurrent_consumers ({})",
                self.min_concurrent_consumers, self.max_concurrent_consumers
            )));
        }

        if self.messages_per_consumer_ratio == 0 {
            return Err(AmqpError::ConfigError(
                "messages_per_consumer_ratio must be at least 1".to_owned(),
            ));
        }

        if self.auto_scale_interval.is_zero() {
            return Err(AmqpError::ConfigError(
                "auto_scale_interval must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Policy object deciding the target subscription count for a queue.
///
/// Implementations never block on I/O; the consumer supplies the observed
/// queue depth and its current active count.
pub trait ConsumerCountManager: Send + Sync + 'static {
    /// The target number of concurrent subscriptions.
    fn target_scale(&self, queue_depth: u32, current_active: u32) -> u32;

    /// How often the consumer should re-evaluate its scale.
    fn scale_interval(&self) -> Duration;
}

/// Depth-driven count manager: one subscription per
/// `messages_per_consumer_ratio` queued messages, clamped to the configured
/// bounds.
pub struct DynamicConsumerCountManager {
    config: ConsumerCountManagerConfig,
}

impl DynamicConsumerCountManager {
    /// Creates a manager from a validated configuration.
    pub fn new(config: ConsumerCountManagerConfig) -> Result<DynamicConsumerCountManager, AmqpError> {
        config.validate()?;
        Ok(DynamicConsumerCountManager { config })
    }
}

impl ConsumerCountManager for DynamicConsumerCountManager {
    fn target_scale(&self, queue_depth: u32, current_active: u32) -> u32 {
        let desired = queue_depth.div_ceil(self.config.messages_per_consumer_ratio);
        let target = desired.clamp(
            self.config.min_concurrent_consumers,
            self.config.max_concurrent_consumers,
        );

        if target != current_active {
            debug!(
                queue_depth,
                current_active, target, "consumer count target changed"
            );
        }

        target
    }

    fn scale_interval(&self) -> Duration {
        self.config.auto_scale_interval
    }
}

/// Degenerate count manager pinning the subscription count.
///
/// Equivalent to a dynamic manager with `min == max`; useful when delivery
/// order matters (a single pinned consumer preserves queue order).
pub struct FixedConsumerCountManager {
    consumers: u32,
    interval: Duration,
}

impl FixedConsumerCountManager {
    /// Pins the subscription count, re-checked every 30 seconds so crashed
    /// subscriptions are replaced.
    pub fn new(consumers: u32) -> FixedConsumerCountManager {
        FixedConsumerCountManager {
            consumers,
            interval: Duration::from_secs(30),
        }
    }

    /// Overrides the reconcile interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl ConsumerCountManager for FixedConsumerCountManager {
    fn target_scale(&self, _queue_depth: u32, _current_active: u32) -> u32 {
        self.consumers
    }

    fn scale_interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(min: u32, max: u32, ratio: u32) -> DynamicConsumerCountManager {
        DynamicConsumerCountManager::new(ConsumerCountManagerConfig {
            min_concurrent_consumers: min,
            max_concurrent_consumers: max,
            messages_per_consumer_ratio: ratio,
            auto_scale_interval: Duration::from_secs(10),
        })
        .unwrap()
    }

    #[test]
    fn scales_to_max_under_load_and_back_to_min_when_drained() {
        let manager = manager(1, 10, 5);

        // 47 queued messages at 5 per consumer want 10 subscriptions
        assert_eq!(manager.target_scale(47, 1), 10);

        // drained to 3 messages, back down to a single subscription
        assert_eq!(manager.target_scale(3, 10), 1);
    }

    #[test]
    fn rounds_partial_consumers_up() {
        let manager = manager(0, 100, 10);

        assert_eq!(manager.target_scale(0, 0), 0);
        assert_eq!(manager.target_scale(1, 0), 1);
        assert_eq!(manager.target_scale(10, 0), 1);
        assert_eq!(manager.target_scale(11, 0), 2);
    }

    #[test]
    fn respects_lower_bound_when_queue_is_empty() {
        let manager = manager(2, 8, 5);
        assert_eq!(manager.target_scale(0, 5), 2);
    }

    #[test]
    fn respects_upper_bound_under_burst() {
        let manager = manager(2, 8, 5);
        assert_eq!(manager.target_scale(u32::MAX, 2), 8);
    }

    #[test]
    fn min_equal_max_pins_the_target() {
        let manager = manager(4, 4, 1);

        assert_eq!(manager.target_scale(0, 4), 4);
        assert_eq!(manager.target_scale(1000, 4), 4);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let result = DynamicConsumerCountManager::new(ConsumerCountManagerConfig {
            min_concurrent_consumers: 5,
            max_concurrent_consumers: 2,
            ..ConsumerCountManagerConfig::default()
        });

        assert!(matches!(result, Err(AmqpError::ConfigError(_))));
    }

    #[test]
    fn rejects_zero_ratio() {
        let result = DynamicConsumerCountManager::new(ConsumerCountManagerConfig {
            messages_per_consumer_ratio: 0,
            ..ConsumerCountManagerConfig::default()
        });

        assert!(matches!(result, Err(AmqpError::ConfigError(_))));
    }

    #[test]
    fn rejects_zero_interval() {
        let result = DynamicConsumerCountManager::new(ConsumerCountManagerConfig {
            auto_scale_interval: Duration::ZERO,
            ..ConsumerCountManagerConfig::default()
        });

        assert!(matches!(result, Err(AmqpError::ConfigError(_))));
    }

    #[test]
    fn fixed_manager_ignores_depth() {
        let manager = FixedConsumerCountManager::new(3);

        assert_eq!(manager.target_scale(0, 3), 3);
        assert_eq!(manager.target_scale(10_000, 3), 3);
        assert_eq!(manager.scale_interval(), Duration::from_secs(30));
    }

    #[test]
    fn fixed_manager_interval_override() {
        let manager = FixedConsumerCountManager::new(1).with_interval(Duration::from_secs(5));
        assert_eq!(manager.scale_interval(), Duration::from_secs(5));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ConsumerCountManagerConfig::default().validate().is_ok());
    }
}
