use std::time::Duration;

use crate::consts::ID_LEN_BITS;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SystemConfig {
    pub routing: RoutingConfig,
    pub timing: TimingConfig,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RoutingConfig {
    // Also called k in the original paper
    pub bucket_size: usize,

    // Lookup parallelism, alpha in the original paper
    pub alpha: u32,

    // Hard bound on bucket splitting, buckets can never outgrow the
    // identifier bit width
    pub max_buckets: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            bucket_size: 20,
            alpha: 3,
            max_buckets: ID_LEN_BITS,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TimingConfig {
    // Deadline for plain application requests
    pub request_timeout: Duration,

    // Shorter per-candidate bound used inside iterative lookups
    pub lookup_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(3),
        }
    }
}
