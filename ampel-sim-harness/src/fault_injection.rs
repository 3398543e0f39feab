//! Fault injection for coordination testing
//!
//! Link faults are drawn per delivery from a seeded RNG, so a scenario run
//! with the same seed replays the same losses, duplicates and delays:
//! - Message loss
//! - Message duplication
//! - Message delays (which also reorder frames)
//!
//! Partitions and crashes are scheduled by the scenarios on the cluster
//! itself.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;

/// Fault injection configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultConfig {
    /// Probability of message loss (0.0-1.0)
    pub message_loss_rate: f64,
    /// Probability a delivered message arrives twice (0.0-1.0)
    pub duplicate_rate: f64,
    /// Minimum message delay in milliseconds
    pub min_delay_ms: u64,
    /// Maximum message delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            message_loss_rate: 0.0,
            duplicate_rate: 0.0,
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

impl FaultConfig {
    /// No faults (happy path)
    pub fn none() -> Self {
        Self::default()
    }

    /// Lossy radio: 20% loss, 10% duplicates, up to 300ms delay
    pub fn lossy() -> Self {
        Self {
            message_loss_rate: 0.20,
            duplicate_rate: 0.10,
            min_delay_ms: 0,
            max_delay_ms: 300,
        }
    }
}

/// Seeded fault source for a cluster
pub struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(config: FaultConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Replace the fault model, keeping the RNG stream
    pub fn set_config(&mut self, config: FaultConfig) {
        self.config = config;
    }

    /// Check if a message should be dropped
    pub fn should_drop_message(&mut self) -> bool {
        self.config.message_loss_rate > 0.0 && self.rng.gen::<f64>() < self.config.message_loss_rate
    }

    /// Check if a message should be delivered twice
    pub fn should_duplicate(&mut self) -> bool {
        self.config.duplicate_rate > 0.0 && self.rng.gen::<f64>() < self.config.duplicate_rate
    }

    /// Get message delay (zero when delays are disabled)
    pub fn message_delay(&mut self) -> Duration {
        let ms = if self.config.min_delay_ms >= self.config.max_delay_ms {
            self.config.min_delay_ms
        } else {
            self.rng
                .gen_range(self.config.min_delay_ms..=self.config.max_delay_ms)
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_faults() {
        let mut injector = FaultInjector::new(FaultConfig::none(), 1);
        for _ in 0..100 {
            assert!(!injector.should_drop_message());
            assert!(!injector.should_duplicate());
            assert_eq!(injector.message_delay(), Duration::ZERO);
        }
    }

    #[test]
    fn test_same_seed_same_faults() {
        let draw = |seed| {
            let mut injector = FaultInjector::new(FaultConfig::lossy(), seed);
            (0..200)
                .map(|_| (injector.should_drop_message(), injector.message_delay()))
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
    }

    #[test]
    fn test_loss_rate_roughly_respected() {
        let mut injector = FaultInjector::new(FaultConfig::lossy(), 42);
        let dropped = (0..10_000).filter(|_| injector.should_drop_message()).count();
        assert!((1_500..2_500).contains(&dropped), "dropped {}", dropped);
    }

    #[test]
    fn test_delay_bounds() {
        let slow = FaultConfig {
            min_delay_ms: 100,
            max_delay_ms: 500,
            ..Default::default()
        };
        let mut injector = FaultInjector::new(slow, 3);
        for _ in 0..1_000 {
            let delay = injector.message_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(500));
        }
    }
}
