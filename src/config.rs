// config.rs

use log::warn;
use std::time::Duration;

pub const LOCK_TIMEOUT_ENV: &str = "REF_LOCK_TIMEOUT";
pub const LOCK_TTL_ENV: &str = "REF_LOCK_TTL";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(200);

pub const DEFAULT_THRESHOLD: u32 = 10;
pub const DEFAULT_BLOCK_SIZE: usize = 10_000;

/// How long to wait for a store lock, and when an existing claim counts as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub ttl: Duration,
    /// Tear down claims older than `ttl` instead of waiting on them.
    pub force: bool,
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            ttl: DEFAULT_LOCK_TTL,
            force: false,
            retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
        }
    }
}

impl LockOptions {
    /// Defaults overridden by `REF_LOCK_TIMEOUT` / `REF_LOCK_TTL` (whole seconds).
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut options = Self::default();
        if let Some(timeout) = seconds_from(&lookup, LOCK_TIMEOUT_ENV) {
            options.timeout = timeout;
        }
        if let Some(ttl) = seconds_from(&lookup, LOCK_TTL_ENV) {
            options.ttl = ttl;
        }
        options
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

fn seconds_from<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str) -> Option<Duration> {
    let raw_value = lookup(name)?;
    match raw_value.trim().parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            warn!(
                "Ignoring {}='{}': expected a whole number of seconds.",
                name, raw_value
            );
            None
        }
    }
}

/// Parameters of a near-neighbor scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    /// Largest number of differing loci still reported as a match (inclusive).
    pub threshold: u32,
    /// Reference rows loaded per block; bounds peak memory.
    pub block_size: usize,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl CompareOptions {
    pub fn new(threshold: u32, block_size: usize) -> Self {
        Self { threshold, block_size }
    }
}
