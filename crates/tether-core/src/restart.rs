//! Keep-alive restart policy.
//!
//! When a keep-alive target dies (or times out loading), the broker asks
//! this policy whether and when to bring it back. Restarts are bounded by a
//! sliding window with a circuit breaker, and each consecutive attempt
//! backs off further until a run survives long enough to count as
//! successful.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;

/// Restart configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Maximum number of restarts within the restart window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Time window for counting restarts.
    #[serde(default = "default_restart_window")]
    #[serde(with = "humantime_serde")]
    pub restart_window: Duration,

    /// Minimum uptime before a restart is considered successful.
    #[serde(default = "default_min_uptime")]
    #[serde(with = "humantime_serde")]
    pub min_uptime: Duration,

    /// Backoff configuration.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_max_restarts() -> u32 {
    5
}

const fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_min_uptime() -> Duration {
    Duration::from_secs(30)
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            min_uptime: default_min_uptime(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between restarts.
    Fixed {
        /// Delay duration.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Exponential backoff.
    Exponential {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,

        /// Multiplier for each retry (default: 2.0).
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Linear backoff.
    Linear {
        /// Initial delay.
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,

        /// Increment per retry.
        #[serde(with = "humantime_serde")]
        increment: Duration,

        /// Maximum delay.
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                #[allow(clippy::cast_possible_wrap)] // attempt count won't exceed i32
                let delay_secs =
                    initial_delay.as_secs_f64() * multiplier.powi((attempt - 1) as i32);
                let delay = Duration::from_secs_f64(delay_secs);
                delay.min(*max_delay)
            },
            Self::Linear {
                initial_delay,
                increment,
                max_delay,
            } => {
                let delay = *initial_delay + *increment * (attempt - 1);
                delay.min(*max_delay)
            },
        }
    }
}

/// Manages restart decisions for one target.
#[derive(Debug)]
pub struct RestartManager {
    /// Restart configuration.
    config: RestartConfig,

    /// Times of restarts within the restart window.
    history: Vec<Instant>,

    /// Current backoff attempt counter.
    backoff_attempt: u32,

    /// Whether the circuit breaker is open (preventing restarts).
    circuit_open: bool,
}

impl RestartManager {
    /// Create a new restart manager.
    #[must_use]
    pub const fn new(config: RestartConfig) -> Self {
        Self {
            config,
            history: Vec::new(),
            backoff_attempt: 0,
            circuit_open: false,
        }
    }

    /// Check if a restart should be allowed.
    #[must_use]
    pub fn should_restart(&self) -> bool {
        if self.circuit_open {
            return false;
        }
        self.recent_restarts() < self.config.max_restarts as usize
    }

    /// Record a restart and get the delay before restarting.
    pub fn record_restart(&mut self) -> Duration {
        self.backoff_attempt += 1;
        let delay = self.config.backoff.delay_for_attempt(self.backoff_attempt);

        self.history.push(Instant::now());
        self.prune_history();

        if self.recent_restarts() >= self.config.max_restarts as usize {
            self.circuit_open = true;
        }

        delay
    }

    /// Record a successful run (uptime exceeded `min_uptime`).
    ///
    /// Resets the backoff counter and closes the circuit breaker.
    pub const fn record_success(&mut self) {
        self.backoff_attempt = 0;
        self.circuit_open = false;
    }

    /// Get the number of restarts within the window.
    #[must_use]
    pub fn restart_count(&self) -> usize {
        self.recent_restarts()
    }

    /// Check if the circuit breaker is open.
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        self.circuit_open
    }

    /// Reset the manager state.
    pub fn reset(&mut self) {
        self.history.clear();
        self.backoff_attempt = 0;
        self.circuit_open = false;
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &RestartConfig {
        &self.config
    }

    fn recent_restarts(&self) -> usize {
        let window = self.config.restart_window;
        self.history
            .iter()
            .filter(|at| at.elapsed() <= window)
            .count()
    }

    fn prune_history(&mut self) {
        let window = self.config.restart_window;
        self.history.retain(|at| at.elapsed() <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let config = BackoffConfig::Exponential {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn test_linear_backoff() {
        let config = BackoffConfig::Linear {
            initial_delay: Duration::from_secs(1),
            increment: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_circuit_breaker_opens_at_limit() {
        let config = RestartConfig {
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
            ..Default::default()
        };
        let mut manager = RestartManager::new(config);

        assert!(manager.should_restart());
        manager.record_restart();
        assert!(manager.should_restart());
        manager.record_restart();
        assert!(manager.should_restart());
        manager.record_restart();

        assert!(!manager.should_restart());
        assert!(manager.is_circuit_open());
    }

    #[test]
    fn test_success_closes_circuit() {
        let config = RestartConfig {
            max_restarts: 1,
            ..Default::default()
        };
        let mut manager = RestartManager::new(config);
        manager.record_restart();
        assert!(manager.is_circuit_open());

        manager.record_success();
        assert!(!manager.is_circuit_open());
    }

    #[test]
    fn test_backoff_grows_per_attempt() {
        let mut manager = RestartManager::new(RestartConfig {
            max_restarts: 10,
            ..Default::default()
        });
        let first = manager.record_restart();
        let second = manager.record_restart();
        assert!(second > first);
    }
}
