//! Pool usage and health statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health classification of a pool, driven by consecutive probe failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    /// Classify a consecutive error count against the configured thresholds.
    pub fn classify(consecutive_errors: u32, degraded_threshold: u32, critical_threshold: u32) -> Self {
        if consecutive_errors > critical_threshold {
            Self::Critical
        } else if consecutive_errors > degraded_threshold {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Who owns the lifecycle of a registered pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolOwner {
    /// Created by the registry on demand.
    Managed,
    /// The bootstrapper's control-plane handle.
    ControlPlane,
    /// Built and registered by a collaborator (tenant provisioning).
    External,
}

/// Point-in-time snapshot of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub key: String,
    pub owner: PoolOwner,
    pub health: HealthStatus,
    pub connection_limit: u32,
    pub queue_limit: u32,
    /// Connections currently checked out.
    pub acquired: u32,
    pub idle: u32,
    /// Callers currently waiting for a connection.
    pub pending: u32,
    /// Connections ever opened by this pool.
    pub total_connections: u64,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    pub idle_for_secs: u64,
}

impl PoolStats {
    /// Whether waiting callers exceed `ratio` of the queue limit.
    pub fn under_pressure(&self, ratio: f64) -> bool {
        self.queue_limit > 0 && f64::from(self.pending) > ratio * f64::from(self.queue_limit)
    }
}

/// Outcome of one health-monitor cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub critical: usize,
    /// Keys whose pools were torn down after reaching critical health.
    pub recreated: Vec<String>,
    pub high_load: bool,
}
