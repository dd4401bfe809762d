//! Load governor.
//!
//! Tracks queueing pressure across all pools and, while the process is under
//! high load, shrinks the connection limit handed to newly created pools.
//! Existing pools keep their size.

use crate::config::ManagerConfig;
use crate::models::{HealthStatus, PoolStats};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug)]
pub struct LoadGovernor {
    high_load: AtomicBool,
    /// Fraction of a pool's queue limit above which it counts as under pressure.
    high_load_ratio: f64,
    /// Multiplier applied to requested connection limits under high load.
    throttle_factor: f64,
    /// Throttled limits never go below this.
    min_connections: u32,
}

impl LoadGovernor {
    pub fn new(high_load_ratio: f64, throttle_factor: f64, min_connections: u32) -> Self {
        Self {
            high_load: AtomicBool::new(false),
            high_load_ratio,
            throttle_factor,
            min_connections,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(
            config.high_load_ratio,
            config.throttle_factor,
            config.min_throttled_connections,
        )
    }

    pub fn is_high_load(&self) -> bool {
        self.high_load.load(Ordering::Acquire)
    }

    pub fn high_load_ratio(&self) -> f64 {
        self.high_load_ratio
    }

    /// Whether `pending` waiters exceed the pressure ratio of `queue_limit`.
    pub fn exceeds_threshold(&self, pending: u32, queue_limit: u32) -> bool {
        queue_limit > 0 && f64::from(pending) > self.high_load_ratio * f64::from(queue_limit)
    }

    /// Called whenever an acquire has to wait; raises the flag on pressure.
    pub fn note_pressure(&self, key: &str, pending: u32, queue_limit: u32) {
        if self.exceeds_threshold(pending, queue_limit)
            && !self.high_load.swap(true, Ordering::AcqRel)
        {
            warn!(
                pool_key = %key,
                pending,
                queue_limit,
                "High load detected, new pools will be throttled"
            );
        }
    }

    /// Connection limit for a pool created now.
    ///
    /// Under high load: `max(min_connections, floor(requested * factor))`.
    /// The floor applies even to requests smaller than it.
    pub fn effective_limit(&self, requested: u32) -> u32 {
        if !self.is_high_load() {
            return requested;
        }
        let throttled = (f64::from(requested) * self.throttle_factor).floor() as u32;
        throttled.max(self.min_connections)
    }

    /// Re-derive the flag from the aggregate state of every pool.
    ///
    /// High load holds while any pool shows queue pressure or is not healthy.
    pub fn recompute(&self, stats: &[PoolStats]) -> bool {
        let high = stats.iter().any(|s| {
            s.under_pressure(self.high_load_ratio) || s.health != HealthStatus::Healthy
        });
        let previous = self.high_load.swap(high, Ordering::AcqRel);
        if previous && !high {
            info!("Load returned to normal, pool throttling lifted");
        } else if !previous && high {
            warn!("High load detected during health check");
        }
        high
    }
}
