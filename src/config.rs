//! Completion-polling configuration.
//!
//! The hardware exposes no interrupt or OS wait primitive for its completion
//! tag, so every wait in this crate is a poll. `WaitConfig` controls how that
//! poll backs off: a hot spin window first, then cooperative yields, then
//! fixed-interval sleeps. All knobs can be overridden from the environment
//! with the `GPU_SYNC_` prefix:
//!
//! | Variable                     | Meaning                                | Default |
//! |------------------------------|----------------------------------------|---------|
//! | `GPU_SYNC_SPIN_ITERATIONS`   | busy-spin probes before yielding       | 1024    |
//! | `GPU_SYNC_YIELD_CYCLES`      | `yield_now` probes before sleeping     | 64      |
//! | `GPU_SYNC_SLEEP_INTERVAL_US` | sleep between probes after that, in µs | 50      |
//! | `GPU_SYNC_WAIT_TIMEOUT_MS`   | wait timeout in ms (0 = unbounded)     | 0       |

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Number of busy-spin probes of the completion cell before yielding.
    pub spin_iterations: u32,
    /// Number of probes separated by `thread::yield_now` before sleeping.
    pub yield_cycles: u32,
    /// Sleep interval between probes once the spin and yield windows are spent.
    pub sleep_interval: Duration,
    /// Upper bound on a blocking wait. `None` polls until the tag advances,
    /// mirroring real hardware latency.
    pub timeout: Option<Duration>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            spin_iterations: 1024,
            yield_cycles: 64,
            sleep_interval: Duration::from_micros(50),
            timeout: None,
        }
    }
}

impl WaitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_spin_iterations(mut self, iterations: u32) -> Self {
        self.spin_iterations = iterations;
        self
    }

    #[must_use]
    pub const fn with_yield_cycles(mut self, cycles: u32) -> Self {
        self.yield_cycles = cycles;
        self
    }

    #[must_use]
    pub const fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds a configuration from the environment, falling back to defaults
    /// for unset or unparsable variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_env_u64("GPU_SYNC_SPIN_ITERATIONS") {
            config.spin_iterations = v as u32;
        }
        if let Some(v) = read_env_u64("GPU_SYNC_YIELD_CYCLES") {
            config.yield_cycles = v as u32;
        }
        if let Some(v) = read_env_u64("GPU_SYNC_SLEEP_INTERVAL_US") {
            config.sleep_interval = Duration::from_micros(v);
        }
        if let Some(v) = read_env_u64("GPU_SYNC_WAIT_TIMEOUT_MS") {
            config.timeout = if v == 0 {
                None
            } else {
                Some(Duration::from_millis(v))
            };
        }

        config
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_wait_is_unbounded() {
        let config = WaitConfig::default();
        assert_eq!(config.timeout, None);
        assert!(config.spin_iterations > 0);
    }

    #[test]
    fn builder_overrides_compose() {
        let config = WaitConfig::new()
            .with_spin_iterations(4)
            .with_yield_cycles(2)
            .with_sleep_interval(Duration::from_micros(10))
            .with_timeout(Duration::from_millis(250));

        assert_eq!(config.spin_iterations, 4);
        assert_eq!(config.yield_cycles, 2);
        assert_eq!(config.sleep_interval, Duration::from_micros(10));
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
    }
}
