//! Health monitor and idle reclaimer.
//!
//! Two background loops share the [`ConnectionManager`]:
//!
//! - The health loop probes every pool, tracks consecutive failures, tears
//!   down critical pools and re-derives the high-load flag.
//! - The cleanup loop evicts pools nobody has used for the idle timeout.
//!
//! Both loops hold only a `Weak` reference and exit once the manager is
//! dropped. Each cycle is also callable directly.

use crate::db::registry::{ConnectionManager, PoolEntry};
use crate::models::{HealthReport, HealthStatus, PoolOwner, PoolStats};
use futures_util::future::join_all;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

impl ConnectionManager {
    /// Spawn the health and cleanup loops. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut health = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut cleanup = self
            .cleanup_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if health.is_some() || cleanup.is_some() {
            debug!("Background monitors already running");
            return false;
        }

        let health_interval = self.config.health_check_interval;
        let cleanup_interval = self.config.cleanup_interval;
        *health = Some(tokio::spawn(health_loop(
            Arc::downgrade(self),
            health_interval,
        )));
        *cleanup = Some(tokio::spawn(cleanup_loop(
            Arc::downgrade(self),
            cleanup_interval,
        )));

        info!(
            health_interval_secs = health_interval.as_secs(),
            cleanup_interval_secs = cleanup_interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Started pool monitors"
        );
        true
    }

    /// Abort both loops. Safe to call when they are not running.
    pub fn stop(&self) {
        let handles = [
            self.health_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
            self.cleanup_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        ];
        let mut stopped = false;
        for handle in handles.into_iter().flatten() {
            handle.abort();
            stopped = true;
        }
        if stopped {
            info!("Stopped pool monitors");
        }
    }

    pub fn is_running(&self) -> bool {
        self.health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run one health cycle over every registered pool.
    pub async fn run_health_checks(&self) -> HealthReport {
        let degraded = self.config.degraded_threshold;
        let critical = self.config.critical_threshold;
        let entries = self.entries().await;

        let probes = entries.iter().map(|entry| async move {
            let result = entry.pool().probe().await;
            (entry, result)
        });
        let results = join_all(probes).await;

        let mut report = HealthReport {
            checked: results.len(),
            ..Default::default()
        };
        let mut failing = Vec::new();
        for (entry, result) in results {
            let status = match result {
                Ok(()) => entry.record_success(degraded, critical),
                Err(e) => {
                    let status = entry.record_failure(&e, degraded, critical);
                    warn!(
                        pool_key = %entry.key(),
                        consecutive_errors = entry.consecutive_errors(),
                        health = %status,
                        error = %e,
                        "Pool health probe failed"
                    );
                    status
                }
            };
            match status {
                HealthStatus::Healthy => report.healthy += 1,
                HealthStatus::Degraded => report.degraded += 1,
                HealthStatus::Critical => {
                    report.critical += 1;
                    failing.push(Arc::clone(entry));
                }
            }
        }

        for entry in failing {
            if self.recreate(&entry).await {
                report.recreated.push(entry.key().to_string());
            }
        }

        let stats: Vec<PoolStats> = self.all_pool_stats().await.into_values().collect();
        report.high_load = self.governor.recompute(&stats);

        debug!(
            checked = report.checked,
            healthy = report.healthy,
            degraded = report.degraded,
            critical = report.critical,
            high_load = report.high_load,
            "Health check complete"
        );
        report
    }

    /// Tear down a critical pool.
    ///
    /// The control-plane pool is rebuilt at once through the bootstrapper;
    /// other keys are recreated by their next `get_pool` or by their owner.
    async fn recreate(&self, entry: &Arc<PoolEntry>) -> bool {
        let key = entry.key();
        if !self.evict_if_current(key, entry).await {
            return false;
        }

        error!(
            pool_key = %key,
            consecutive_errors = entry.consecutive_errors(),
            "Pool is critical, recreating"
        );
        let pool = entry.pool().clone();
        tokio::spawn(async move { pool.close().await });

        if entry.owner() == PoolOwner::ControlPlane {
            self.bootstrapper.invalidate().await;
            match self.get_entry(key, None).await {
                Ok(_) => info!(pool_key = %key, "Control-plane pool recreated"),
                Err(e) => error!(
                    pool_key = %key,
                    error = %e,
                    "Control-plane pool could not be recreated"
                ),
            }
        }
        true
    }

    fn is_reclaimable(&self, entry: &PoolEntry, idle_timeout: Duration) -> bool {
        !self.config.is_protected(entry.key())
            && entry.in_use() == 0
            && entry.pending() == 0
            && entry.idle_for() > idle_timeout
    }

    /// Evict every unprotected pool idle for longer than the idle timeout.
    ///
    /// Returns the evicted keys.
    pub async fn reclaim_idle_pools(&self) -> Vec<String> {
        let idle_timeout = self.config.idle_timeout;

        // Phase 1: collect candidates under the read lock
        let candidates: Vec<String> = {
            let pools = self.pools.read().await;
            pools
                .iter()
                .filter(|(_, cell)| {
                    cell.get()
                        .is_some_and(|entry| self.is_reclaimable(entry, idle_timeout))
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        // Phase 2: re-check and remove under a brief write lock, close outside it
        let mut evicted = Vec::new();
        for key in candidates {
            let removed = {
                let mut pools = self.pools.write().await;
                let still_idle = pools
                    .get(&key)
                    .and_then(|cell| cell.get())
                    .is_some_and(|entry| self.is_reclaimable(entry, idle_timeout));
                if !still_idle {
                    debug!(pool_key = %key, "Pool used during cleanup, skipping");
                    continue;
                }
                pools.remove(&key)
            };

            if let Some(entry) = removed.as_ref().and_then(|cell| cell.get()) {
                info!(
                    pool_key = %key,
                    idle_secs = entry.idle_for().as_secs(),
                    "Closing idle pool"
                );
                entry.pool().close().await;
                evicted.push(key);
            }
        }
        self.sweep_empty_cells().await;
        evicted
    }

    /// Remove cells whose creation failed and that no caller is still filling.
    async fn sweep_empty_cells(&self) {
        let mut pools = self.pools.write().await;
        let before = pools.len();
        pools.retain(|_, cell| cell.initialized() || Arc::strong_count(cell) > 1);
        let swept = before - pools.len();
        if swept > 0 {
            debug!(count = swept, "Swept uninitialised pool cells");
        }
    }
}

async fn health_loop(manager: Weak<ConnectionManager>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(manager) = manager.upgrade() else {
            info!("Connection manager dropped, health loop exiting");
            return;
        };
        let report = manager.run_health_checks().await;
        if !report.recreated.is_empty() {
            warn!(recreated = ?report.recreated, "Recreated critical pools");
        }
        // Drop strong reference before sleeping to allow manager deallocation
        drop(manager);
    }
}

async fn cleanup_loop(manager: Weak<ConnectionManager>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(manager) = manager.upgrade() else {
            info!("Connection manager dropped, cleanup loop exiting");
            return;
        };
        let evicted = manager.reclaim_idle_pools().await;
        if !evicted.is_empty() {
            info!(count = evicted.len(), pools = ?evicted, "Reclaimed idle pools");
        }
        drop(manager);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ManagerConfig;
    use crate::db::registry::ConnectionManager;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> std::sync::Arc<ConnectionManager> {
        let base = format!("sqlite://{}", dir.path().display());
        let mut config =
            ManagerConfig::new(format!("{}/control.db", base)).with_tenant_base_url(base);
        config.health_check_interval = Duration::from_secs(3600);
        config.cleanup_interval = Duration::from_secs(3600);
        ConnectionManager::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        assert!(manager.start());
        assert!(!manager.start());
        assert!(manager.is_running());

        manager.stop();
        assert!(!manager.is_running());
        assert!(manager.start());
        manager.shutdown().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_health_check_counts_healthy_pools() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.get_pool("reports", None).await.unwrap();
        manager.get_pool("audit", None).await.unwrap();

        let report = manager.run_health_checks().await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.healthy, 2);
        assert!(report.recreated.is_empty());
        assert!(!report.high_load);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_fresh_pools_are_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        manager.get_pool("reports", None).await.unwrap();

        assert!(manager.reclaim_idle_pools().await.is_empty());
        assert!(manager.has_pool("reports").await);
        manager.shutdown().await;
    }
}
