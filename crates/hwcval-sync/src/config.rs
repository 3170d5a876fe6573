//! Environment-driven engine configuration.

use std::time::Duration;

use thiserror::Error;

use crate::release_pool::{
    ReleaseMode, ReleasePolicy, ReleasePoolConfig, DEFAULT_BEFORE_OLDEST, DEFAULT_POOL_SIZE,
};

pub const ENV_POOL_SIZE: &str = "HWCVAL_FENCE_POOL_SIZE";
pub const ENV_RETAIN_OLDEST: &str = "HWCVAL_RETAIN_OLDEST";
pub const ENV_RELEASE_MODE: &str = "HWCVAL_RELEASE_MODE";
pub const ENV_FENCE_TIMEOUT_MS: &str = "HWCVAL_FENCE_TIMEOUT_MS";
pub const ENV_RANDOM_SEED: &str = "HWCVAL_RANDOM_SEED";
pub const ENV_TICK_PERIOD_US: &str = "HWCVAL_TICK_PERIOD_US";

pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_millis(1000);
/// One 60Hz frame.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_micros(16_667);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("{var} must be at least {min}")]
    OutOfRange { var: &'static str, min: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub pool_size: usize,
    pub before_oldest: u32,
    pub release_mode: ReleaseMode,
    pub fence_timeout: Duration,
    pub random_seed: Option<u64>,
    pub tick_period: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            before_oldest: DEFAULT_BEFORE_OLDEST,
            release_mode: ReleaseMode::Sequential,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            random_seed: None,
            tick_period: DEFAULT_TICK_PERIOD,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable source; unset or blank variables keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parse_u64 = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            get(var)
                .map(|v| {
                    v.parse::<u64>()
                        .map_err(|_| ConfigError::InvalidEnv { var, value: v })
                })
                .transpose()
        };

        let defaults = Self::default();

        let pool_size = match parse_u64(ENV_POOL_SIZE)? {
            Some(0) => {
                return Err(ConfigError::OutOfRange {
                    var: ENV_POOL_SIZE,
                    min: 1,
                })
            }
            Some(n) => usize::try_from(n).map_err(|_| ConfigError::InvalidEnv {
                var: ENV_POOL_SIZE,
                value: n.to_string(),
            })?,
            None => defaults.pool_size,
        };

        let before_oldest = match parse_u64(ENV_RETAIN_OLDEST)? {
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::InvalidEnv {
                var: ENV_RETAIN_OLDEST,
                value: n.to_string(),
            })?,
            None => defaults.before_oldest,
        };

        let release_mode = match get(ENV_RELEASE_MODE) {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_RELEASE_MODE,
                value: v,
            })?,
            None => defaults.release_mode,
        };

        let fence_timeout = parse_u64(ENV_FENCE_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.fence_timeout);

        let random_seed = parse_u64(ENV_RANDOM_SEED)?;

        let tick_period = match parse_u64(ENV_TICK_PERIOD_US)? {
            Some(0) => {
                return Err(ConfigError::OutOfRange {
                    var: ENV_TICK_PERIOD_US,
                    min: 1,
                })
            }
            Some(us) => Duration::from_micros(us),
            None => defaults.tick_period,
        };

        Ok(Self {
            pool_size,
            before_oldest,
            release_mode,
            fence_timeout,
            random_seed,
            tick_period,
        })
    }

    pub fn pool_config(&self) -> ReleasePoolConfig {
        ReleasePoolConfig {
            pool_size: self.pool_size,
            before_oldest: self.before_oldest,
            mode: self.release_mode,
            seed: self.random_seed,
        }
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.release_mode.with_before_oldest(self.before_oldest)
    }
}
