use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// ~180 m of latitude per cell.
pub const DEFAULT_CELL_SIZE_DEGREES: f64 = 0.18 / 111.32;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub throttle_ms: u64,
    pub grace_ms: u64,
    pub store_timeout_ms: u64,
    pub enter_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub delete_retries: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 10_000,
            grace_ms: 30_000,
            store_timeout_ms: 8_000,
            enter_attempts: 2,
            retry_base_ms: 1_000,
            retry_cap_ms: 30_000,
            delete_retries: 5,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            throttle_ms: env_or("PRESENCE_THROTTLE_MS", d.throttle_ms),
            grace_ms: env_or("PRESENCE_GRACE_MS", d.grace_ms),
            store_timeout_ms: env_or("PRESENCE_STORE_TIMEOUT_MS", d.store_timeout_ms),
            enter_attempts: env_or("PRESENCE_ENTER_ATTEMPTS", d.enter_attempts).max(1),
            retry_base_ms: env_or("PRESENCE_RETRY_BASE_MS", d.retry_base_ms),
            retry_cap_ms: env_or("PRESENCE_RETRY_CAP_MS", d.retry_cap_ms),
            delete_retries: env_or("PRESENCE_DELETE_RETRIES", d.delete_retries),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Exponential backoff without jitter; the lifecycle retries a single
    /// record so there is no herd to spread out.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.retry_base_ms
                .saturating_mul(factor)
                .min(self.retry_cap_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            stale_after_ms: 5_000,
        }
    }
}

impl SubscriptionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            backoff_base_ms: env_or("SUBSCRIPTION_BACKOFF_BASE_MS", d.backoff_base_ms),
            backoff_cap_ms: env_or("SUBSCRIPTION_BACKOFF_CAP_MS", d.backoff_cap_ms),
            stale_after_ms: env_or("SUBSCRIPTION_STALE_AFTER_MS", d.stale_after_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub radius_km: f64,
    pub cluster_threshold: usize,
    pub cell_size_degrees: f64,
    pub recompute_ms: u64,
    pub recenter_ms: u64,
    pub marker_cache_capacity: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            radius_km: 5.0,
            cluster_threshold: 30,
            cell_size_degrees: DEFAULT_CELL_SIZE_DEGREES,
            recompute_ms: 1_000,
            recenter_ms: 3_000,
            marker_cache_capacity: 64,
        }
    }
}

impl MatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            radius_km: env_or("MATCH_RADIUS_KM", d.radius_km),
            cluster_threshold: env_or("MATCH_CLUSTER_THRESHOLD", d.cluster_threshold),
            cell_size_degrees: env_or("MATCH_CELL_SIZE_DEGREES", d.cell_size_degrees),
            recompute_ms: env_or("MATCH_RECOMPUTE_MS", d.recompute_ms),
            recenter_ms: env_or("MATCH_RECENTER_MS", d.recenter_ms),
            marker_cache_capacity: env_or("MARKER_CACHE_CAPACITY", d.marker_cache_capacity),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub lifecycle: LifecycleConfig,
    pub subscription: SubscriptionConfig,
    pub matching: MatchConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            lifecycle: LifecycleConfig::from_env(),
            subscription: SubscriptionConfig::from_env(),
            matching: MatchConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_cap() {
        let cfg = LifecycleConfig::default();
        assert_eq!(cfg.retry_delay(0), Duration::from_secs(1));
        assert_eq!(cfg.retry_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.retry_delay(4), Duration::from_secs(16));
        assert_eq!(cfg.retry_delay(5), Duration::from_secs(30));
        assert_eq!(cfg.retry_delay(63), Duration::from_secs(30));
    }

    #[test]
    fn default_cell_is_about_180_metres() {
        let metres = DEFAULT_CELL_SIZE_DEGREES * 111_320.0;
        assert!((metres - 180.0).abs() < 1.0);
    }

    #[test]
    fn partial_json_config_falls_back_to_defaults() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{"matching": {"radius_km": 2.5}}"#).unwrap();
        assert_eq!(cfg.matching.radius_km, 2.5);
        assert_eq!(cfg.matching.cluster_threshold, 30);
        assert_eq!(cfg.lifecycle.grace_ms, 30_000);
    }
}
